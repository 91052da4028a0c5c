//! Folds scan results into measurements and measurements into estimates

use crate::domain::types::AccessPointReading;
use crate::domain::{Estimate, Measurement, MeasurementBuilder};
use crate::infra::metrics::Metrics;
use crate::io::scan::{ScanDispatcher, ScanSource};
use crate::services::scheduler::{SchedulerGates, SCAN_QUEUE_DEPTH};
use crate::services::state::LocatorState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct EstimateAggregator {
    scans_per_measurement: usize,
    builder: MeasurementBuilder,
    state: Arc<LocatorState>,
    gates: Arc<SchedulerGates>,
    metrics: Arc<Metrics>,
}

impl EstimateAggregator {
    pub fn new(
        scans_per_measurement: u32,
        state: Arc<LocatorState>,
        gates: Arc<SchedulerGates>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            scans_per_measurement: scans_per_measurement.max(1) as usize,
            builder: MeasurementBuilder::new(),
            state,
            gates,
            metrics,
        }
    }

    /// Scans folded into the current cycle so far
    pub fn pending_scans(&self) -> usize {
        self.builder.scans()
    }

    /// Fold one scan. Returns an estimate when this scan completes a cycle
    /// and the algorithm resolves a position.
    pub fn on_scan(&mut self, readings: &[AccessPointReading]) -> Option<Estimate> {
        self.metrics.record_scan_received();
        self.builder.add_scan(readings);
        if self.builder.scans() < self.scans_per_measurement {
            return None;
        }

        let measurement = std::mem::take(&mut self.builder).finish();
        self.estimate(&measurement)
    }

    fn estimate(&self, measurement: &Measurement) -> Option<Estimate> {
        let start = Instant::now();
        // Read at finalization so a building switch applies to this cycle
        let building = self.state.active_building();
        let algorithm = self.state.algorithm();

        let estimate = match &building {
            Some(building) if !measurement.is_empty() => algorithm
                .estimate(measurement, building)
                .map(|result| Estimate::from_result(&result, building.id)),
            _ => None,
        };
        self.metrics.record_measurement(start.elapsed().as_micros() as u64, estimate.is_some());

        match &estimate {
            Some(e) => {
                self.gates.estimate_received();
                debug!(
                    building_id = ?e.building_id.map(|b| b.0),
                    vertex_id = ?e.vertex_id.map(|v| v.0),
                    accuracy = e.accuracy,
                    "estimate_produced"
                );
            }
            None => {
                debug!(
                    access_points = measurement.len(),
                    has_building = building.is_some(),
                    "estimation_miss"
                );
            }
        }
        estimate
    }
}

/// Short dedicated acquisition through a temporary consumer.
///
/// Starts one scan, then another after each result, until `scans` results
/// arrived or `timeout` elapsed. A partial measurement is returned if at
/// least one scan arrived. The consumer is always unregistered.
pub async fn collect_measurement(
    scanner: &dyn ScanSource,
    dispatcher: &ScanDispatcher,
    scans: u32,
    timeout: Duration,
) -> Option<Measurement> {
    let mut subscription = dispatcher.register(SCAN_QUEUE_DEPTH);
    let wanted = scans.max(1) as usize;
    let mut builder = MeasurementBuilder::new();

    if scanner.start_scan() {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                report = subscription.rx.recv() => {
                    let Some(report) = report else { break };
                    builder.add_scan(&report);
                    if builder.scans() >= wanted {
                        break;
                    }
                    scanner.start_scan();
                }
                _ = &mut deadline => {
                    warn!(received = builder.scans(), wanted, "measurement_acquisition_timeout");
                    break;
                }
            }
        }
    } else {
        warn!("measurement_acquisition_scan_unavailable");
    }

    dispatcher.unregister(subscription.id);
    (builder.scans() > 0).then(|| builder.finish())
}
