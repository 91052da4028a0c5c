//! Motion-gated scan scheduling
//!
//! One polling loop decides when to start a wireless scan:
//! - after an estimate it cools down for the update interval
//! - otherwise it scans only if the device moved since the last estimate
//!   and the previous scan's result has been consumed
//!
//! Scan results are consumed by a companion task that feeds the
//! `EstimateAggregator` and re-opens the ready gate. Both tasks belong to
//! a single run; starting again stops the previous run first.

use crate::infra::config::MIN_UPDATE_INTERVAL_MS;
use crate::infra::metrics::Metrics;
use crate::io::scan::{ConsumerId, ScanDispatcher, ScanReport, ScanSource};
use crate::services::aggregator::EstimateAggregator;
use crate::services::fanout::NotificationFanout;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Queue depth for scan results waiting on the consumer
pub const SCAN_QUEUE_DEPTH: usize = 16;

/// Gate flags shared by the loop, the scan consumer and the motion input
#[derive(Debug, Default)]
pub struct SchedulerGates {
    moved_since_last_estimate: AtomicBool,
    ready_for_next_scan: AtomicBool,
    just_received_estimate: AtomicBool,
}

impl SchedulerGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force one estimate on start: we pause when no movement is seen
    pub fn reset_for_start(&self) {
        self.just_received_estimate.store(false, Ordering::Release);
        self.ready_for_next_scan.store(true, Ordering::Release);
        self.moved_since_last_estimate.store(true, Ordering::Release);
    }

    pub fn mark_moved(&self) {
        self.moved_since_last_estimate.store(true, Ordering::Release);
    }

    pub fn has_moved(&self) -> bool {
        self.moved_since_last_estimate.load(Ordering::Acquire)
    }

    pub fn is_ready_for_next_scan(&self) -> bool {
        self.ready_for_next_scan.load(Ordering::Acquire)
    }

    /// Close the ready gate if it is open. Only the caller that closes it may scan.
    pub fn try_claim_scan(&self) -> bool {
        self.ready_for_next_scan
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn scan_completed(&self) {
        self.ready_for_next_scan.store(true, Ordering::Release);
    }

    /// A fresh estimate starts the cooldown and re-arms the movement gate
    pub fn estimate_received(&self) {
        self.just_received_estimate.store(true, Ordering::Release);
        self.moved_since_last_estimate.store(false, Ordering::Release);
    }

    pub fn take_just_received_estimate(&self) -> bool {
        self.just_received_estimate.swap(false, Ordering::AcqRel)
    }
}

/// Effective scan settings after clamping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    scans_per_measurement: u32,
    update_interval: Duration,
}

impl ScanSettings {
    /// At least one scan per measurement; update interval at least one second
    pub fn new(scans_per_measurement: u32, update_interval_ms: u64) -> Self {
        Self {
            scans_per_measurement: scans_per_measurement.max(1),
            update_interval: Duration::from_millis(update_interval_ms.max(MIN_UPDATE_INTERVAL_MS)),
        }
    }

    pub fn scans_per_measurement(&self) -> u32 {
        self.scans_per_measurement
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::new(2, 3000)
    }
}

/// Handles of one scheduler run
struct SchedulerRun {
    shutdown_tx: watch::Sender<bool>,
    consumer_id: ConsumerId,
    loop_handle: JoinHandle<()>,
    consumer_handle: JoinHandle<()>,
}

impl SchedulerRun {
    async fn shutdown(self, dispatcher: &ScanDispatcher) {
        let _ = self.shutdown_tx.send(true);
        dispatcher.unregister(self.consumer_id);
        if let Err(e) = self.loop_handle.await {
            error!(error = %e, "scheduler_loop_join_failed");
        }
        if let Err(e) = self.consumer_handle.await {
            error!(error = %e, "scan_consumer_join_failed");
        }
    }
}

/// Decrements the live-loop count when a loop exits, however it exits
struct LiveLoop(Arc<AtomicUsize>);

impl LiveLoop {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for LiveLoop {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct PositioningScheduler {
    scanner: Arc<dyn ScanSource>,
    dispatcher: Arc<ScanDispatcher>,
    gates: Arc<SchedulerGates>,
    poll_interval: Duration,
    metrics: Arc<Metrics>,
    runtime: Handle,
    scanning_enabled: AtomicBool,
    live_loops: Arc<AtomicUsize>,
    run: Mutex<Option<SchedulerRun>>,
}

impl PositioningScheduler {
    pub fn new(
        scanner: Arc<dyn ScanSource>,
        dispatcher: Arc<ScanDispatcher>,
        gates: Arc<SchedulerGates>,
        poll_interval: Duration,
        metrics: Arc<Metrics>,
        runtime: Handle,
    ) -> Self {
        Self {
            scanner,
            dispatcher,
            gates,
            poll_interval,
            metrics,
            runtime,
            scanning_enabled: AtomicBool::new(false),
            live_loops: Arc::new(AtomicUsize::new(0)),
            run: Mutex::new(None),
        }
    }

    pub fn gates(&self) -> &Arc<SchedulerGates> {
        &self.gates
    }

    pub fn is_running(&self) -> bool {
        self.scanning_enabled.load(Ordering::Acquire)
    }

    /// Number of scheduler loops currently alive
    pub fn active_loops(&self) -> usize {
        self.live_loops.load(Ordering::Acquire)
    }

    /// Start scanning. A run already in progress is fully stopped first.
    pub async fn start(
        &self,
        settings: ScanSettings,
        aggregator: EstimateAggregator,
        fanout: Arc<NotificationFanout>,
    ) {
        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            info!("scheduler_restarting");
            previous.shutdown(&self.dispatcher).await;
        }

        self.gates.reset_for_start();
        let subscription = self.dispatcher.register(SCAN_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer_handle = self.runtime.spawn(consume_scans(
            subscription.rx,
            aggregator,
            fanout,
            self.gates.clone(),
            shutdown_rx.clone(),
        ));
        let loop_handle = self.runtime.spawn(scan_loop(
            self.scanner.clone(),
            self.gates.clone(),
            self.poll_interval,
            settings.update_interval(),
            self.metrics.clone(),
            shutdown_rx,
            LiveLoop::enter(self.live_loops.clone()),
        ));

        *run = Some(SchedulerRun {
            shutdown_tx,
            consumer_id: subscription.id,
            loop_handle,
            consumer_handle,
        });
        self.scanning_enabled.store(true, Ordering::Release);

        info!(
            scans_per_measurement = settings.scans_per_measurement(),
            update_interval_ms = settings.update_interval().as_millis() as u64,
            "scheduler_started"
        );
    }

    /// Stop scanning and unregister the scan consumer. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let mut run = self.run.lock().await;
        self.scanning_enabled.store(false, Ordering::Release);
        match run.take() {
            Some(previous) => {
                previous.shutdown(&self.dispatcher).await;
                info!("scheduler_stopped");
                true
            }
            None => false,
        }
    }
}

/// Sleep unless shutdown is requested first. Returns false on shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

async fn scan_loop(
    scanner: Arc<dyn ScanSource>,
    gates: Arc<SchedulerGates>,
    poll_interval: Duration,
    update_interval: Duration,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
    _live: LiveLoop,
) {
    debug!("scheduler_loop_started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        if gates.take_just_received_estimate() {
            if !sleep_or_shutdown(update_interval, &mut shutdown).await {
                break;
            }
            continue;
        }

        if gates.has_moved() && gates.try_claim_scan() {
            if scanner.start_scan() {
                metrics.record_scan_triggered();
                debug!("scan_initiated");
            } else {
                // Nothing is in flight, so nothing will re-open the gate
                gates.scan_completed();
                debug!("scan_unavailable");
            }
        }

        if !sleep_or_shutdown(poll_interval, &mut shutdown).await {
            break;
        }
    }

    debug!("scheduler_loop_stopped");
}

async fn consume_scans(
    mut scan_rx: mpsc::Receiver<ScanReport>,
    mut aggregator: EstimateAggregator,
    fanout: Arc<NotificationFanout>,
    gates: Arc<SchedulerGates>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            report = scan_rx.recv() => {
                let Some(report) = report else { break };
                if let Some(estimate) = aggregator.on_scan(&report) {
                    fanout.notify_device(&estimate);
                }
                gates.scan_completed();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
