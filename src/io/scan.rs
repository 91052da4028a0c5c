//! Wireless scan plumbing
//!
//! A `ScanSource` starts scans; completed results are handed to the
//! `ScanDispatcher`, which fans them out to every registered consumer.
//! Consumers receive results on bounded channels; a full consumer queue
//! drops the result rather than blocking the scan driver.

use crate::domain::types::AccessPointReading;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Result of one completed wireless scan
pub type ScanReport = Vec<AccessPointReading>;

/// Scan driver. Results are delivered asynchronously through the dispatcher.
pub trait ScanSource: Send + Sync {
    /// Request a scan. Returns false if the radio cannot scan right now.
    fn start_scan(&self) -> bool;
}

/// Identifies a registered scan consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

/// Receiving side of a registration
pub struct ScanSubscription {
    pub id: ConsumerId,
    pub rx: mpsc::Receiver<ScanReport>,
}

/// Fan-out of scan results to registered consumers
pub struct ScanDispatcher {
    consumers: Mutex<Vec<(ConsumerId, mpsc::Sender<ScanReport>)>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ScanDispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { consumers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), metrics }
    }

    /// Register a consumer with a queue of the given depth
    pub fn register(&self, capacity: usize) -> ScanSubscription {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.consumers.lock().push((id, tx));
        debug!(consumer = id.0, "scan_consumer_registered");
        ScanSubscription { id, rx }
    }

    /// Remove a consumer; its receiver sees the channel close
    pub fn unregister(&self, id: ConsumerId) -> bool {
        let mut consumers = self.consumers.lock();
        let before = consumers.len();
        consumers.retain(|(cid, _)| *cid != id);
        let removed = consumers.len() != before;
        if removed {
            debug!(consumer = id.0, "scan_consumer_unregistered");
        }
        removed
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Deliver a completed scan to every consumer
    pub fn deliver(&self, report: ScanReport) {
        let consumers: Vec<_> = self.consumers.lock().iter().map(|(_, tx)| tx.clone()).collect();
        for tx in consumers {
            match tx.try_send(report.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics.record_scan_dropped();
                    warn!("scan_result_dropped: consumer queue full");
                }
                // Consumer went away between snapshot and send
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}
