//! Infrastructure-based positioning poll loop
//!
//! Asks the backend to start locating this client, then polls for the
//! latest backend-computed position at a fixed interval and forwards each
//! result to infrastructure listeners. Stopping ends the loop and tells the
//! backend to stop without waiting for its answer.

use crate::domain::Estimate;
use crate::infra::config::MIN_UPDATE_INTERVAL_MS;
use crate::io::backend::Backend;
use crate::services::fanout::NotificationFanout;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct PollerRun {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct InfrastructurePoller {
    backend: Arc<dyn Backend>,
    fanout: Arc<NotificationFanout>,
    runtime: Handle,
    run: Mutex<Option<PollerRun>>,
}

impl InfrastructurePoller {
    pub fn new(backend: Arc<dyn Backend>, fanout: Arc<NotificationFanout>, runtime: Handle) -> Self {
        Self { backend, fanout, runtime, run: Mutex::new(None) }
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// Start polling; the interval clamps to one second. Returns the effective interval.
    pub async fn start(&self, update_interval_ms: u64) -> Duration {
        let interval = Duration::from_millis(update_interval_ms.max(MIN_UPDATE_INTERVAL_MS));

        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            self.shutdown(previous).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = self.runtime.spawn(poll_loop(
            self.backend.clone(),
            self.fanout.clone(),
            interval,
            shutdown_rx,
        ));
        *run = Some(PollerRun { shutdown_tx, handle });

        info!(interval_ms = interval.as_millis() as u64, "infrastructure_positioning_started");
        interval
    }

    /// Returns false if not running
    pub async fn stop(&self) -> bool {
        let previous = self.run.lock().await.take();
        match previous {
            Some(previous) => {
                self.shutdown(previous).await;
                info!("infrastructure_positioning_stopped");
                true
            }
            None => false,
        }
    }

    async fn shutdown(&self, run: PollerRun) {
        let _ = run.shutdown_tx.send(true);
        if let Err(e) = run.handle.await {
            error!(error = %e, "infrastructure_loop_join_failed");
        }

        let backend = self.backend.clone();
        let client_id = self.fanout.client_id().to_string();
        self.runtime.spawn(async move {
            if let Err(e) = backend.stop_infrastructure_positioning(&client_id).await {
                warn!(error = %format!("{:#}", e), "infrastructure_stop_failed");
            }
        });
    }
}

async fn poll_loop(
    backend: Arc<dyn Backend>,
    fanout: Arc<NotificationFanout>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let client_id = fanout.client_id().to_string();
    if let Err(e) = backend.start_infrastructure_positioning(&client_id).await {
        warn!(error = %format!("{:#}", e), "infrastructure_start_failed");
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match backend.poll_infrastructure_position(&client_id).await {
            Ok(Some(position)) => {
                if *shutdown.borrow() {
                    break;
                }
                fanout.notify_infrastructure(&Estimate::from(position));
            }
            Ok(None) => debug!("infrastructure_no_position"),
            Err(e) => warn!(error = %format!("{:#}", e), "infrastructure_poll_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::InfrastructureEstimate;
    use crate::domain::types::{Building, BuildingId, VertexId};
    use crate::domain::TrackedPosition;
    use crate::infra::metrics::Metrics;
    use crate::services::fanout::{Channel, LocationListener};
    use crate::services::state::LocatorState;
    use crate::services::tracking::TrackingBuffer;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct PollingBackend {
        starts: AtomicUsize,
        polls: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Backend for PollingBackend {
        async fn fetch_building_list(&self) -> anyhow::Result<Vec<Building>> {
            Ok(Vec::new())
        }

        async fn fetch_building(&self, id: BuildingId) -> anyhow::Result<Building> {
            anyhow::bail!("no building {}", id)
        }

        async fn upload_tracked_positions(&self, _batch: Vec<TrackedPosition>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn start_infrastructure_positioning(&self, _client_id: &str) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn poll_infrastructure_position(
            &self,
            _client_id: &str,
        ) -> anyhow::Result<Option<InfrastructureEstimate>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(InfrastructureEstimate {
                latitude: 57.0,
                longitude: 10.0,
                altitude: 0.0,
                accuracy: 4.0,
                bearing: 0.0,
                speed: 0.0,
                building_id: BuildingId(1),
                vertex_id: VertexId(2),
            }))
        }

        async fn stop_infrastructure_positioning(&self, _client_id: &str) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Counter(AtomicUsize);

    impl LocationListener for Counter {
        fn on_location_changed(&self, _estimate: &Estimate) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_at_clamped_interval() {
        let backend = Arc::new(PollingBackend::default());
        let metrics = Arc::new(Metrics::new());
        let tracking =
            Arc::new(TrackingBuffer::new(3, backend.clone(), metrics.clone(), Handle::current()));
        let fanout = Arc::new(NotificationFanout::new(
            Arc::new(LocatorState::new()),
            tracking,
            "client-1".into(),
            metrics,
        ));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        fanout.add_listener(Channel::Infrastructure, counter.clone());

        let poller = InfrastructurePoller::new(backend.clone(), fanout, Handle::current());
        assert_eq!(poller.start(200).await, Duration::from_millis(1000));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);

        assert!(poller.stop().await);
        assert!(!poller.is_running().await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }
}
