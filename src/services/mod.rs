//! Services - positioning logic and state management
//!
//! - `coordinator` - `LocationService`, owns the state and runs the workflows
//! - `matcher` - building resolution from observed access points
//! - `radio_map_cache` - building list and radio map caching with TTLs
//! - `scheduler` - motion-gated scan loop
//! - `aggregator` - scans to measurements to estimates
//! - `algorithm` - pluggable positioning algorithms
//! - `fanout` - listener registries
//! - `tracking` - tracked-position buffer and upload
//! - `infrastructure` - backend-computed position polling
//! - `state` - shared positioning state

pub mod aggregator;
pub mod algorithm;
pub mod coordinator;
pub mod fanout;
pub mod infrastructure;
pub mod matcher;
pub mod radio_map_cache;
pub mod scheduler;
pub mod state;
pub mod tracking;

// Re-export commonly used types
pub use algorithm::{NearestNeighbour, PositioningAlgorithm};
pub use coordinator::LocationService;
pub use fanout::{Channel, ListenerId, LocationListener};
pub use scheduler::ScanSettings;
