//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics bumped from the scan, estimate and upload
//! paths. `report()` swaps the windowed counters to zero.
//!
//! Relaxed ordering throughout: these are statistics, never read for
//! scheduling or gating decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a value using binary search
#[inline]
fn bucket_index(value: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < value)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Wireless scans requested by the scheduler (monotonic)
    scans_triggered: AtomicU64,
    /// Scan results folded into a measurement (monotonic)
    scans_received: AtomicU64,
    /// Measurement cycles finalized (monotonic)
    measurements_completed: AtomicU64,
    /// Device estimates delivered to listeners (monotonic)
    estimates_delivered: AtomicU64,
    /// Cycles where the algorithm produced nothing (monotonic)
    estimation_misses: AtomicU64,
    /// Infrastructure estimates delivered (monotonic)
    infrastructure_estimates: AtomicU64,
    /// Positions appended to the tracking buffer (monotonic)
    positions_tracked: AtomicU64,
    /// Batches uploaded successfully (monotonic)
    batches_uploaded: AtomicU64,
    /// Failed batch uploads (monotonic)
    upload_failures: AtomicU64,
    /// Positions lost with failed batches (monotonic)
    positions_lost: AtomicU64,
    /// Enable/download workflows ending in a connection problem (monotonic)
    connection_problems: AtomicU64,
    /// Scan results dropped because a consumer queue was full (monotonic)
    scans_dropped: AtomicU64,
    /// Estimation latency histogram in µs (reset on report)
    estimate_latency_buckets: [AtomicU64; NUM_BUCKETS],
    estimate_latency_sum_us: AtomicU64,
    estimate_latency_max_us: AtomicU64,
    estimates_since_report: AtomicU64,
    /// Upload latency histogram in ms (reset on report)
    upload_latency_buckets: [AtomicU64; NUM_BUCKETS],
    upload_latency_sum_ms: AtomicU64,
    uploads_since_report: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            scans_triggered: AtomicU64::new(0),
            scans_received: AtomicU64::new(0),
            measurements_completed: AtomicU64::new(0),
            estimates_delivered: AtomicU64::new(0),
            estimation_misses: AtomicU64::new(0),
            infrastructure_estimates: AtomicU64::new(0),
            positions_tracked: AtomicU64::new(0),
            batches_uploaded: AtomicU64::new(0),
            upload_failures: AtomicU64::new(0),
            positions_lost: AtomicU64::new(0),
            connection_problems: AtomicU64::new(0),
            scans_dropped: AtomicU64::new(0),
            estimate_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            estimate_latency_sum_us: AtomicU64::new(0),
            estimate_latency_max_us: AtomicU64::new(0),
            estimates_since_report: AtomicU64::new(0),
            upload_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            upload_latency_sum_ms: AtomicU64::new(0),
            uploads_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_scan_triggered(&self) {
        self.scans_triggered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_received(&self) {
        self.scans_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_dropped(&self) {
        self.scans_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finalized measurement and how long the algorithm took (lock-free)
    #[inline]
    pub fn record_measurement(&self, latency_us: u64, produced_estimate: bool) {
        self.measurements_completed.fetch_add(1, Ordering::Relaxed);
        if !produced_estimate {
            self.estimation_misses.fetch_add(1, Ordering::Relaxed);
        }
        self.estimates_since_report.fetch_add(1, Ordering::Relaxed);
        self.estimate_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.estimate_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.estimate_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_estimate_delivered(&self) {
        self.estimates_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_infrastructure_estimate(&self) {
        self.infrastructure_estimates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_tracked(&self) {
        self.positions_tracked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful batch upload (lock-free)
    #[inline]
    pub fn record_upload(&self, latency_ms: u64) {
        self.batches_uploaded.fetch_add(1, Ordering::Relaxed);
        self.uploads_since_report.fetch_add(1, Ordering::Relaxed);
        self.upload_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.upload_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_upload_failure(&self, positions: usize) {
        self.upload_failures.fetch_add(1, Ordering::Relaxed);
        self.positions_lost.fetch_add(positions as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connection_problem(&self) {
        self.connection_problems.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scans_triggered(&self) -> u64 {
        self.scans_triggered.load(Ordering::Relaxed)
    }

    pub fn measurements_completed(&self) -> u64 {
        self.measurements_completed.load(Ordering::Relaxed)
    }

    pub fn estimates_delivered(&self) -> u64 {
        self.estimates_delivered.load(Ordering::Relaxed)
    }

    pub fn positions_lost(&self) -> u64 {
        self.positions_lost.load(Ordering::Relaxed)
    }

    /// Generate a report and reset windowed counters
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Current values; the reporting window is left untouched
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let window = |counter: &AtomicU64| -> u64 {
            if reset {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };
        let histogram = |buckets: &[AtomicU64; NUM_BUCKETS]| -> [u64; NUM_BUCKETS] {
            if reset {
                swap_buckets(buckets)
            } else {
                load_buckets(buckets)
            }
        };

        let estimate_count = window(&self.estimates_since_report);
        let estimate_sum = window(&self.estimate_latency_sum_us);
        let estimate_max = window(&self.estimate_latency_max_us);
        let estimate_lat_buckets = histogram(&self.estimate_latency_buckets);

        let upload_count = window(&self.uploads_since_report);
        let upload_sum = window(&self.upload_latency_sum_ms);
        let upload_lat_buckets = histogram(&self.upload_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let measurements_per_min = if elapsed.as_secs_f64() > 0.0 {
            estimate_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            scans_triggered: self.scans_triggered.load(Ordering::Relaxed),
            scans_received: self.scans_received.load(Ordering::Relaxed),
            scans_dropped: self.scans_dropped.load(Ordering::Relaxed),
            measurements_completed: self.measurements_completed.load(Ordering::Relaxed),
            estimates_delivered: self.estimates_delivered.load(Ordering::Relaxed),
            estimation_misses: self.estimation_misses.load(Ordering::Relaxed),
            infrastructure_estimates: self.infrastructure_estimates.load(Ordering::Relaxed),
            positions_tracked: self.positions_tracked.load(Ordering::Relaxed),
            batches_uploaded: self.batches_uploaded.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            positions_lost: self.positions_lost.load(Ordering::Relaxed),
            connection_problems: self.connection_problems.load(Ordering::Relaxed),
            measurements_per_min,
            estimate_lat_buckets,
            estimate_lat_avg_us: if estimate_count > 0 { estimate_sum / estimate_count } else { 0 },
            estimate_lat_max_us: estimate_max,
            estimate_lat_p99_us: percentile_from_buckets(&estimate_lat_buckets, 0.99),
            upload_lat_buckets,
            upload_lat_avg_ms: if upload_count > 0 { upload_sum / upload_count } else { 0 },
        }
    }
}

/// Summary of metrics for a reporting period
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub scans_triggered: u64,
    pub scans_received: u64,
    pub scans_dropped: u64,
    pub measurements_completed: u64,
    pub estimates_delivered: u64,
    pub estimation_misses: u64,
    pub infrastructure_estimates: u64,
    pub positions_tracked: u64,
    pub batches_uploaded: u64,
    pub upload_failures: u64,
    pub positions_lost: u64,
    pub connection_problems: u64,
    pub measurements_per_min: f64,
    pub estimate_lat_buckets: [u64; NUM_BUCKETS],
    pub estimate_lat_avg_us: u64,
    pub estimate_lat_max_us: u64,
    pub estimate_lat_p99_us: u64,
    pub upload_lat_buckets: [u64; NUM_BUCKETS],
    pub upload_lat_avg_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            scans_triggered = %self.scans_triggered,
            measurements = %self.measurements_completed,
            measurements_per_min = format!("{:.1}", self.measurements_per_min),
            estimates = %self.estimates_delivered,
            misses = %self.estimation_misses,
            infra_estimates = %self.infrastructure_estimates,
            tracked = %self.positions_tracked,
            uploads = %self.batches_uploaded,
            upload_failures = %self.upload_failures,
            estimate_p99_us = %self.estimate_lat_p99_us,
            "metrics"
        );
    }
}
