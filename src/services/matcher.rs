//! Building resolution from a measurement
//!
//! Counts, per candidate building, the observed access points that appear
//! in its permissible list. The first building to reach the highest
//! non-zero count wins.

use crate::domain::types::{Building, BuildingId};
use crate::domain::Measurement;
use tracing::debug;

pub fn resolve(measurement: Option<&Measurement>, candidates: &[Building]) -> Option<BuildingId> {
    let measurement = measurement?;
    if candidates.is_empty() {
        return None;
    }

    let mut best: Option<BuildingId> = None;
    let mut max = 0usize;

    for building in candidates {
        let common = measurement
            .access_points()
            .filter(|ap| building.permissible_aps.iter().any(|p| p == ap))
            .count();
        // Strict: ties keep the earlier building
        if common > max {
            max = common;
            best = Some(building.id);
        }
    }

    debug!(building = ?best.map(|b| b.0), common_aps = max, "building_resolved");
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::AccessPointReading;
    use crate::domain::MeasurementBuilder;

    fn measurement(aps: &[&str]) -> Measurement {
        let mut builder = MeasurementBuilder::new();
        let scan: Vec<_> = aps.iter().map(|ap| AccessPointReading::new(ap, -60)).collect();
        builder.add_scan(&scan);
        builder.finish()
    }

    #[test]
    fn test_most_common_aps_wins() {
        let candidates = vec![
            Building::shallow(BuildingId(1), "A", &["x", "y"]),
            Building::shallow(BuildingId(2), "B", &["y", "z"]),
        ];
        let m = measurement(&["y", "z"]);
        assert_eq!(resolve(Some(&m), &candidates), Some(BuildingId(2)));
    }

    #[test]
    fn test_tie_keeps_first() {
        let candidates = vec![
            Building::shallow(BuildingId(1), "A", &["x"]),
            Building::shallow(BuildingId(2), "B", &["x"]),
        ];
        let m = measurement(&["x"]);
        assert_eq!(resolve(Some(&m), &candidates), Some(BuildingId(1)));
    }

    #[test]
    fn test_no_overlap_is_none() {
        let candidates = vec![Building::shallow(BuildingId(1), "A", &["x"])];
        let m = measurement(&["q"]);
        assert_eq!(resolve(Some(&m), &candidates), None);
    }

    #[test]
    fn test_missing_inputs_are_none() {
        let candidates = vec![Building::shallow(BuildingId(1), "A", &["x"])];
        assert_eq!(resolve(None, &candidates), None);
        assert_eq!(resolve(Some(&measurement(&["x"])), &[]), None);
    }
}
