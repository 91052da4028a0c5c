//! Prometheus metrics HTTP endpoint
//!
//! Exposes locator metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(output: &mut String, name: &str, help: &str, buckets: &[u64; METRICS_NUM_BUCKETS], avg: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {}", avg * count);
    let _ = writeln!(output, "{name}_count {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_scan_metrics(&mut output, &summary);
    write_estimate_metrics(&mut output, &summary);
    write_tracking_metrics(&mut output, &summary);

    output
}

fn write_scan_metrics(output: &mut String, summary: &MetricsSummary) {
    use MetricType::Counter;
    write_metric(output, "locator_scans_triggered_total", "Wireless scans started", Counter, summary.scans_triggered);
    write_metric(output, "locator_scans_received_total", "Scan results folded into measurements", Counter, summary.scans_received);
    write_metric(output, "locator_scans_dropped_total", "Scan results dropped on a full consumer queue", Counter, summary.scans_dropped);
}

fn write_estimate_metrics(output: &mut String, summary: &MetricsSummary) {
    use MetricType::{Counter, Gauge};
    write_metric(output, "locator_measurements_total", "Finalized measurements", Counter, summary.measurements_completed);
    write_metric(output, "locator_estimates_delivered_total", "Estimates delivered to listeners", Counter, summary.estimates_delivered);
    write_metric(output, "locator_estimation_misses_total", "Measurements that produced no estimate", Counter, summary.estimation_misses);
    write_metric(
        output,
        "locator_infrastructure_estimates_total",
        "Backend-computed positions received",
        Counter,
        summary.infrastructure_estimates,
    );
    write_metric(output, "locator_connection_problems_total", "Failed building or radio map fetches", Counter, summary.connection_problems);
    write_metric(output, "locator_estimate_latency_max_us", "Max estimation latency in window", Gauge, summary.estimate_lat_max_us);
    write_histogram(
        output,
        "locator_estimate_latency_us",
        "Positioning algorithm latency in microseconds",
        &summary.estimate_lat_buckets,
        summary.estimate_lat_avg_us,
    );
}

fn write_tracking_metrics(output: &mut String, summary: &MetricsSummary) {
    use MetricType::Counter;
    write_metric(output, "locator_positions_tracked_total", "Positions appended to the tracking buffer", Counter, summary.positions_tracked);
    write_metric(output, "locator_batches_uploaded_total", "Tracked-position batches uploaded", Counter, summary.batches_uploaded);
    write_metric(output, "locator_upload_failures_total", "Failed tracked-position uploads", Counter, summary.upload_failures);
    write_metric(output, "locator_positions_lost_total", "Positions lost in failed uploads", Counter, summary.positions_lost);
    write_histogram(
        output,
        "locator_upload_latency_ms",
        "Tracked-position upload latency in milliseconds",
        &summary.upload_lat_buckets,
        summary.upload_lat_avg_ms,
    );
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            response(StatusCode::OK, "text/plain; version=0.0.4", format_prometheus_metrics(&metrics))
        }
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", "ok"),
        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    })
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, metrics.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_scan_triggered();
        metrics.record_measurement(150, true);
        metrics.record_measurement(250, false);
        metrics.record_upload(12);

        let output = format_prometheus_metrics(&metrics);

        assert!(output.contains("locator_scans_triggered_total 1"));
        assert!(output.contains("locator_measurements_total 2"));
        assert!(output.contains("locator_estimation_misses_total 1"));
        assert!(output.contains("locator_estimate_latency_us_bucket{le=\"200\"} 1"));
        assert!(output.contains("locator_estimate_latency_us_count 2"));
        assert!(output.contains("locator_upload_latency_ms_count 1"));

        // A scrape leaves the reporter's window intact
        let again = format_prometheus_metrics(&metrics);
        assert!(again.contains("locator_estimate_latency_us_count 2"));
        assert_eq!(metrics.report().estimate_lat_avg_us, 200);
    }
}
