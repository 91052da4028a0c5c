//! Tracked-position buffer with batched, fire-and-forget upload
//!
//! Positions are appended under a short lock. Once the buffer holds
//! `flush_count` entries the whole batch is moved out and handed to an
//! upload task; appends continue against the emptied buffer. A failed
//! upload is logged and counted, not retried.

use crate::domain::TrackedPosition;
use crate::infra::metrics::Metrics;
use crate::io::backend::Backend;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct TrackingBuffer {
    buffer: Mutex<Vec<TrackedPosition>>,
    flush_count: usize,
    backend: Arc<dyn Backend>,
    metrics: Arc<Metrics>,
    runtime: Handle,
}

impl TrackingBuffer {
    pub fn new(flush_count: usize, backend: Arc<dyn Backend>, metrics: Arc<Metrics>, runtime: Handle) -> Self {
        let flush_count = flush_count.max(1);
        Self { buffer: Mutex::new(Vec::with_capacity(flush_count)), flush_count, backend, metrics, runtime }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a position. Returns the upload task if this append triggered a flush.
    pub fn append(&self, position: TrackedPosition) -> Option<JoinHandle<()>> {
        let len = {
            let mut buffer = self.buffer.lock();
            buffer.push(position);
            buffer.len()
        };
        self.metrics.record_position_tracked();

        if len >= self.flush_count {
            self.flush()
        } else {
            None
        }
    }

    /// Move everything buffered into an upload task. None if the buffer was empty.
    pub fn flush(&self) -> Option<JoinHandle<()>> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return None;
        }

        debug!(positions = batch.len(), "tracking_flush");
        let backend = self.backend.clone();
        let metrics = self.metrics.clone();
        Some(self.runtime.spawn(upload(backend, batch, metrics)))
    }
}

async fn upload(backend: Arc<dyn Backend>, batch: Vec<TrackedPosition>, metrics: Arc<Metrics>) {
    let positions = batch.len();
    let start = Instant::now();
    match backend.upload_tracked_positions(batch).await {
        Ok(()) => {
            metrics.record_upload(start.elapsed().as_millis() as u64);
            debug!(positions, "tracked_positions_uploaded");
        }
        Err(e) => {
            metrics.record_upload_failure(positions);
            warn!(positions, error = %format!("{:#}", e), "tracked_positions_upload_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::{Fix, InfrastructureEstimate};
    use crate::domain::types::{Building, BuildingId};
    use crate::domain::Provider;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingBackend {
        batches: Mutex<Vec<Vec<TrackedPosition>>>,
        fail: bool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn fetch_building_list(&self) -> anyhow::Result<Vec<Building>> {
            Ok(Vec::new())
        }

        async fn fetch_building(&self, id: BuildingId) -> anyhow::Result<Building> {
            anyhow::bail!("no building {}", id)
        }

        async fn upload_tracked_positions(&self, batch: Vec<TrackedPosition>) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("backend unavailable");
            }
            self.batches.lock().push(batch);
            Ok(())
        }

        async fn start_infrastructure_positioning(&self, _client_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn poll_infrastructure_position(
            &self,
            _client_id: &str,
        ) -> anyhow::Result<Option<InfrastructureEstimate>> {
            Ok(None)
        }

        async fn stop_infrastructure_positioning(&self, _client_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn position() -> TrackedPosition {
        let fix = Fix {
            provider: Provider::Gps,
            latitude: 57.0,
            longitude: 10.0,
            altitude: 0.0,
            accuracy: Some(8.0),
            bearing: None,
            speed: None,
        };
        TrackedPosition::from_fix(&fix, "client-1")
    }

    #[tokio::test]
    async fn test_three_appends_flush_once() {
        let backend = Arc::new(RecordingBackend::default());
        let buffer = TrackingBuffer::new(3, backend.clone(), Arc::new(Metrics::new()), Handle::current());

        assert!(buffer.append(position()).is_none());
        assert!(buffer.append(position()).is_none());
        let upload = buffer.append(position()).expect("third append flushes");
        assert!(buffer.is_empty());

        upload.await.unwrap();
        let batches = backend.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[tokio::test]
    async fn test_failed_upload_is_counted_not_retried() {
        let backend = Arc::new(RecordingBackend { fail: true, ..Default::default() });
        let metrics = Arc::new(Metrics::new());
        let buffer = TrackingBuffer::new(2, backend.clone(), metrics.clone(), Handle::current());

        buffer.append(position());
        buffer.append(position()).unwrap().await.unwrap();

        assert!(buffer.is_empty());
        assert_eq!(metrics.positions_lost(), 2);
        assert!(backend.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let backend = Arc::new(RecordingBackend::default());
        let buffer = TrackingBuffer::new(3, backend, Arc::new(Metrics::new()), Handle::current());
        assert!(buffer.flush().is_none());
    }
}
