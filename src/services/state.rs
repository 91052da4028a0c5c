//! Process-wide positioning state
//!
//! Holds the active building, the selected algorithm, the last status code
//! and the tracking switch. Readers get cheap `Arc` snapshots; the
//! aggregator reads the active building at finalization time, not at scan
//! time.

use crate::domain::types::{Building, BuildingId, RadioMap, StatusCode};
use crate::services::algorithm::{NearestNeighbour, PositioningAlgorithm};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct LocatorState {
    active_building: RwLock<Option<Arc<Building>>>,
    algorithm: RwLock<Arc<dyn PositioningAlgorithm>>,
    status: AtomicI8,
    tracking_allowed: AtomicBool,
}

impl LocatorState {
    pub fn new() -> Self {
        Self {
            active_building: RwLock::new(None),
            algorithm: RwLock::new(Arc::new(NearestNeighbour::default())),
            status: AtomicI8::new(StatusCode::RadioMapNotDownloaded.code()),
            tracking_allowed: AtomicBool::new(false),
        }
    }

    pub fn active_building(&self) -> Option<Arc<Building>> {
        self.active_building.read().clone()
    }

    pub fn set_active_building(&self, building: Option<Arc<Building>>) {
        if let Some(b) = &building {
            info!(building_id = %b.id, name = %b.display_name(), full = b.is_full(), "active_building_set");
        }
        *self.active_building.write() = building;
    }

    /// Attach a radio map to the active building if it has the given id.
    /// Name and permissible access points are kept.
    pub fn attach_radio_map(&self, id: BuildingId, radio_map: Arc<RadioMap>) -> bool {
        let mut active = self.active_building.write();
        let merged = match active.as_deref() {
            Some(current) if current.id == id => current.clone().with_radio_map(radio_map),
            _ => return false,
        };
        *active = Some(Arc::new(merged));
        true
    }

    pub fn algorithm(&self) -> Arc<dyn PositioningAlgorithm> {
        self.algorithm.read().clone()
    }

    pub fn set_algorithm(&self, algorithm: Arc<dyn PositioningAlgorithm>) {
        info!(algorithm = %algorithm.name(), "positioning_algorithm_set");
        *self.algorithm.write() = algorithm;
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.status.load(Ordering::Acquire))
            .unwrap_or(StatusCode::RadioMapNotDownloaded)
    }

    pub fn set_status(&self, status: StatusCode) {
        self.status.store(status.code(), Ordering::Release);
    }

    pub fn tracking_allowed(&self) -> bool {
        self.tracking_allowed.load(Ordering::Acquire)
    }

    pub fn set_tracking_allowed(&self, allowed: bool) {
        self.tracking_allowed.store(allowed, Ordering::Release);
    }
}

impl Default for LocatorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_keeps_metadata() {
        let state = LocatorState::new();
        state.set_active_building(Some(Arc::new(Building::shallow(BuildingId(4), "Hall", &["x"]))));

        assert!(state.attach_radio_map(BuildingId(4), Arc::new(RadioMap::default())));
        let active = state.active_building().unwrap();
        assert!(active.is_full());
        assert_eq!(active.display_name(), "Hall");
        assert_eq!(active.permissible_aps, vec!["x".to_string()]);
    }

    #[test]
    fn test_attach_ignores_other_building() {
        let state = LocatorState::new();
        state.set_active_building(Some(Arc::new(Building::shallow(BuildingId(4), "Hall", &[]))));
        assert!(!state.attach_radio_map(BuildingId(5), Arc::new(RadioMap::default())));
        assert!(!state.active_building().unwrap().is_full());
    }

    #[test]
    fn test_status_defaults_to_not_downloaded() {
        let state = LocatorState::new();
        assert_eq!(state.status(), StatusCode::RadioMapNotDownloaded);
        state.set_status(StatusCode::ConnectionProblem);
        assert_eq!(state.status(), StatusCode::ConnectionProblem);
    }
}
