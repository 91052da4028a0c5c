//! Domain models - core positioning types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Building` / `RadioMap` - shallow and full building records
//! - `Measurement` - signal strengths aggregated across scans
//! - `Estimate` - a resolved position delivered to listeners
//! - `TrackedPosition` - the snapshot uploaded for analytics
//! - `StatusCode` - outcomes reported on the status channel

pub mod measurement;
pub mod position;
pub mod types;

// Re-export commonly used types at module level
pub use measurement::{Measurement, MeasurementBuilder};
pub use position::{Estimate, EstimateResult, Fix, Provider, TrackedPosition};
pub use types::{AccessPointReading, Building, BuildingId, RadioMap, StatusCode, VertexId};
