//! Fingerprint positioning algorithms
//!
//! `PositioningAlgorithm` is the pluggable seam: given a finalized
//! measurement and a full building, produce an estimate or nothing.
//! The default is nearest neighbour in signal space (NNSS).

use crate::domain::position::EstimateResult;
use crate::domain::types::{AbsoluteLocation, Building, VertexId};
use crate::domain::Measurement;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Signal strength assumed for an access point missing on one side (dBm)
pub const MISSING_RSSI_DBM: f64 = -100.0;

/// Candidates kept for diagnostics and error estimation
pub const DEFAULT_CANDIDATES: usize = 3;

/// Error floor when no neighbouring candidate exists (metres)
pub const MIN_ERROR_ESTIMATE_M: f64 = 1.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub trait PositioningAlgorithm: Send + Sync {
    fn name(&self) -> &str;

    /// None when the building has no radio map or the signals do not overlap it
    fn estimate(&self, measurement: &Measurement, building: &Building) -> Option<EstimateResult>;
}

/// Nearest neighbour in signal space
#[derive(Debug, Clone)]
pub struct NearestNeighbour {
    candidates: usize,
}

impl NearestNeighbour {
    pub fn new(candidates: usize) -> Self {
        Self { candidates: candidates.max(1) }
    }
}

impl Default for NearestNeighbour {
    fn default() -> Self {
        Self::new(DEFAULT_CANDIDATES)
    }
}

/// Euclidean distance over the union of access points. None if nothing overlaps.
fn signal_distance(measurement: &Measurement, fingerprint: &BTreeMap<String, f64>) -> Option<f64> {
    let mut overlap = 0usize;
    let mut sum = 0.0;

    for (bssid, mean) in measurement.means() {
        let reference = match fingerprint.get(bssid) {
            Some(v) => {
                overlap += 1;
                *v
            }
            None => MISSING_RSSI_DBM,
        };
        sum += (mean - reference).powi(2);
    }
    for (bssid, reference) in fingerprint {
        if measurement.mean(bssid).is_none() {
            sum += (MISSING_RSSI_DBM - reference).powi(2);
        }
    }

    (overlap > 0).then(|| sum.sqrt())
}

/// Equirectangular distance, adequate at building scale
fn ground_distance_m(a: &AbsoluteLocation, b: &AbsoluteLocation) -> f64 {
    let mean_lat = ((a.latitude + b.latitude) / 2.0).to_radians();
    let dx = (b.longitude - a.longitude).to_radians() * mean_lat.cos();
    let dy = (b.latitude - a.latitude).to_radians();
    (dx * dx + dy * dy).sqrt() * EARTH_RADIUS_M
}

impl PositioningAlgorithm for NearestNeighbour {
    fn name(&self) -> &str {
        "nnss"
    }

    fn estimate(&self, measurement: &Measurement, building: &Building) -> Option<EstimateResult> {
        let radio_map = building.radio_map.as_ref()?;
        if measurement.is_empty() {
            return None;
        }

        let mut ranked: Vec<(f64, usize)> = radio_map
            .vertices
            .iter()
            .enumerate()
            .filter_map(|(idx, v)| signal_distance(measurement, &v.fingerprint).map(|d| (d, idx)))
            .collect();
        // Stable: equal distances keep radio map order
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.truncate(self.candidates);

        let (_, best_idx) = *ranked.first()?;
        let best = &radio_map.vertices[best_idx];

        let neighbours: Vec<f64> = ranked[1..]
            .iter()
            .map(|(_, idx)| ground_distance_m(&best.location, &radio_map.vertices[*idx].location))
            .collect();
        let error_estimate = if neighbours.is_empty() {
            MIN_ERROR_ESTIMATE_M
        } else {
            (neighbours.iter().sum::<f64>() / neighbours.len() as f64).max(MIN_ERROR_ESTIMATE_M)
        };

        let candidates: SmallVec<[(VertexId, f64); 4]> =
            ranked.iter().map(|(d, idx)| (radio_map.vertices[*idx].id, *d)).collect();

        Some(EstimateResult { vertex_id: best.id, location: best.location, error_estimate, candidates })
    }
}
