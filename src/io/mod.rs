//! IO modules - external system interfaces
//!
//! - `backend` - positioning backend client (building lists, radio maps, uploads)
//! - `scan` - scan source trait and result dispatcher
//! - `replay` - scan and motion sources replaying recorded files
//! - `motion` - accelerometer input for the movement gate
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod backend;
pub mod motion;
pub mod prometheus;
pub mod replay;
pub mod scan;

// Re-export commonly used types
pub use backend::{Backend, HttpBackend};
pub use motion::{MotionDetector, MotionSample};
pub use replay::{ReplayMotionSource, ReplayScanSource};
pub use scan::{ScanDispatcher, ScanReport, ScanSource};
