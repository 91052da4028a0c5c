//! Position estimates and tracked positions
//!
//! An `Estimate` is produced once per completed measurement cycle (or per
//! infrastructure poll) and handed straight to listeners. A `TrackedPosition`
//! is the serializable snapshot uploaded to the backend for analytics.

use crate::domain::types::{AbsoluteLocation, BuildingId, VertexId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use smallvec::SmallVec;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Generate a new anonymous client identifier (UUIDv7)
pub fn new_client_id() -> String {
    Uuid::now_v7().to_string()
}

/// Source that produced a position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// On-device Wi-Fi fingerprinting
    DeviceWifi,
    /// Backend-computed from infrastructure sniffing
    InfrastructureWifi,
    Gps,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::DeviceWifi => "device_wifi",
            Provider::InfrastructureWifi => "infrastructure_wifi",
            Provider::Gps => "gps",
            Provider::Other(s) => s,
        }
    }
}

impl Serialize for Provider {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Raw output of a positioning algorithm
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateResult {
    pub vertex_id: VertexId,
    pub location: AbsoluteLocation,
    /// Expected error in meters
    pub error_estimate: f64,
    /// Best candidate set: (vertex, score), best first
    pub candidates: SmallVec<[(VertexId, f64); 4]>,
}

/// A resolved position delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub provider: Provider,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Accuracy in meters
    pub accuracy: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    pub time_ms: u64,
    pub building_id: Option<BuildingId>,
    pub vertex_id: Option<VertexId>,
    /// Diagnostic candidate vertices, aligned with `candidate_scores`
    pub candidate_vertex_ids: SmallVec<[VertexId; 4]>,
    pub candidate_scores: SmallVec<[f64; 4]>,
}

impl Estimate {
    /// Build a device estimate from an algorithm result in the given building
    pub fn from_result(result: &EstimateResult, building_id: BuildingId) -> Self {
        Self {
            provider: Provider::DeviceWifi,
            latitude: result.location.latitude,
            longitude: result.location.longitude,
            altitude: result.location.altitude,
            accuracy: result.error_estimate as f32,
            bearing: None,
            speed: None,
            time_ms: epoch_ms(),
            building_id: Some(building_id),
            vertex_id: Some(result.vertex_id),
            candidate_vertex_ids: result.candidates.iter().map(|(id, _)| *id).collect(),
            candidate_scores: result.candidates.iter().map(|(_, s)| *s).collect(),
        }
    }
}

/// Position reported by the infrastructure positioning backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureEstimate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub bearing: f64,
    #[serde(default)]
    pub speed: f64,
    pub building_id: BuildingId,
    pub vertex_id: VertexId,
}

impl From<InfrastructureEstimate> for Estimate {
    fn from(pos: InfrastructureEstimate) -> Self {
        Self {
            provider: Provider::InfrastructureWifi,
            latitude: pos.latitude,
            longitude: pos.longitude,
            altitude: pos.altitude,
            accuracy: pos.accuracy as f32,
            bearing: Some(pos.bearing as f32),
            speed: Some(pos.speed as f32),
            time_ms: epoch_ms(),
            building_id: Some(pos.building_id),
            vertex_id: Some(pos.vertex_id),
            candidate_vertex_ids: SmallVec::new(),
            candidate_scores: SmallVec::new(),
        }
    }
}

/// A position fix from outside the indoor system (e.g. GPS)
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub provider: Provider,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: Option<f32>,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
}

/// Serializable snapshot of a position for backend analytics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedPosition {
    pub client_id: String,
    pub provider: Provider,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f32,
    pub has_accuracy: bool,
    pub bearing: f32,
    pub has_bearing: bool,
    pub speed: f32,
    pub has_speed: bool,
    pub building_id: Option<BuildingId>,
    pub vertex_id: Option<VertexId>,
    pub time: DateTime<Utc>,
}

/// Non-finite values are not accepted by the backend store
fn finite(value: Option<f32>) -> (f32, bool) {
    match value {
        Some(v) if v.is_finite() => (v, true),
        _ => (0.0, false),
    }
}

impl TrackedPosition {
    pub fn from_estimate(estimate: &Estimate, client_id: &str) -> Self {
        let (accuracy, has_accuracy) = finite(Some(estimate.accuracy));
        let (bearing, has_bearing) = finite(estimate.bearing);
        let (speed, has_speed) = finite(estimate.speed);
        Self {
            client_id: client_id.to_string(),
            provider: estimate.provider.clone(),
            latitude: estimate.latitude,
            longitude: estimate.longitude,
            altitude: estimate.altitude,
            accuracy,
            has_accuracy,
            bearing,
            has_bearing,
            speed,
            has_speed,
            building_id: estimate.building_id,
            vertex_id: estimate.vertex_id,
            time: Utc::now(),
        }
    }

    /// Outdoor fixes carry no building or vertex
    pub fn from_fix(fix: &Fix, client_id: &str) -> Self {
        let (accuracy, has_accuracy) = finite(fix.accuracy);
        let (bearing, has_bearing) = finite(fix.bearing);
        let (speed, has_speed) = finite(fix.speed);
        Self {
            client_id: client_id.to_string(),
            provider: fix.provider.clone(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude,
            accuracy,
            has_accuracy,
            bearing,
            has_bearing,
            speed,
            has_speed,
            building_id: None,
            vertex_id: None,
            time: Utc::now(),
        }
    }
}
