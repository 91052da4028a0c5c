//! Indoor locator - Wi-Fi fingerprint positioning coordinator
//!
//! Resolves the building from observed access points, keeps its radio map
//! fresh, and estimates positions from motion-gated scans.
//!
//! Module structure:
//! - `domain/` - Core types (Building, Measurement, Estimate)
//! - `io/` - External interfaces (backend, scans, motion, Prometheus)
//! - `services/` - Positioning logic (LocationService and its components)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use indoor_locator::domain::types::{Progress, StatusCode};
use indoor_locator::domain::Estimate;
use indoor_locator::infra::{Config, Metrics};
use indoor_locator::io::{HttpBackend, ReplayMotionSource, ReplayScanSource, ScanDispatcher};
use indoor_locator::services::{Channel, LocationListener, LocationService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Indoor locator - Wi-Fi fingerprint positioning
#[derive(Parser, Debug)]
#[command(name = "indoor-locator", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Also poll the backend for infrastructure-based positions
    #[arg(long)]
    infrastructure: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

const MOTION_QUEUE_DEPTH: usize = 32;

/// Logs every estimate and status change
struct LoggingListener {
    channel: Channel,
}

impl LocationListener for LoggingListener {
    fn on_location_changed(&self, estimate: &Estimate) {
        info!(
            channel = self.channel.as_str(),
            provider = %estimate.provider.as_str(),
            lat = estimate.latitude,
            lon = estimate.longitude,
            accuracy = estimate.accuracy,
            building_id = ?estimate.building_id.map(|b| b.0),
            vertex_id = ?estimate.vertex_id.map(|v| v.0),
            "location_changed"
        );
    }

    fn on_status_changed(&self, status: StatusCode, message: &str) {
        info!(status = %status, code = status.code(), message = %message, "status_changed");
    }

    fn on_progress(&self, progress: Progress) {
        info!(progress = progress.as_str(), "progress");
    }
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for scan-level visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "indoor-locator starting");

    let config = Config::load_from_path(&args.config);
    info!(
        config_file = %config.config_file(),
        backend_url = %config.backend_url(),
        scans_per_measurement = %config.scans_per_measurement(),
        update_interval_ms = %config.update_interval_ms(),
        tracking = %config.tracking_enabled(),
        scans_file = %config.replay_scans_file(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let backend = Arc::new(HttpBackend::new(
        config.backend_url(),
        Duration::from_millis(config.backend_timeout_ms()),
    )?);
    let dispatcher = Arc::new(ScanDispatcher::new(metrics.clone()));
    let scanner = Arc::new(
        ReplayScanSource::from_file(config.replay_scans_file(), config.replay_scan_latency(), dispatcher.clone())
            .context("Failed to set up scan source")?,
    );

    let service = LocationService::new(&config, backend, scanner, dispatcher, metrics.clone());
    service.add_listener(Channel::Device, Arc::new(LoggingListener { channel: Channel::Device }));
    service.add_listener(Channel::Infrastructure, Arc::new(LoggingListener { channel: Channel::Infrastructure }));

    // Without a motion feed the movement gate never reopens after the first estimate
    match config.replay_motion_file() {
        Some(motion_file) => {
            let motion = ReplayMotionSource::from_file(motion_file, config.replay_motion_interval())
                .context("Failed to set up motion source")?;
            let (motion_tx, motion_rx) = mpsc::channel(MOTION_QUEUE_DEPTH);
            service.attach_motion_feed(motion_rx);
            tokio::spawn(motion.run(motion_tx, shutdown_rx.clone()));
        }
        None => warn!("no_motion_feed: positioning stops after the first estimate"),
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                indoor_locator::io::prometheus::start_metrics_server(prometheus_port, prom_metrics, prom_shutdown)
                    .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    let status = match service.enable_positioning() {
        Some(handle) => handle.await.context("Enable workflow panicked")?,
        None => service.current_status(),
    };
    if !status.is_ready() {
        warn!(status = %status, "radio_map_unavailable: estimates will be skipped until a building resolves");
    }

    let settings = service.start_positioning(config.scans_per_measurement(), config.update_interval_ms()).await;
    info!(
        scans_per_measurement = settings.scans_per_measurement(),
        update_interval_ms = settings.update_interval().as_millis() as u64,
        "positioning_running"
    );

    if args.infrastructure {
        service.start_infrastructure_positioning(config.infrastructure_interval_ms()).await;
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");

    service.stop_positioning().await;
    service.stop_infrastructure_positioning().await;
    let _ = shutdown_tx.send(true);

    if let Some(upload) = service.flush_tracking() {
        if let Err(e) = upload.await {
            warn!(error = %e, "final_upload_join_failed");
        }
    }
    metrics.report().log();

    info!("indoor-locator shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_precedence() {
        std::env::remove_var("CONFIG_FILE");
        let args = Args::try_parse_from(["indoor-locator"]).unwrap();
        assert_eq!(args.config, "config/dev.toml");

        std::env::set_var("CONFIG_FILE", "config/site.toml");
        let args = Args::try_parse_from(["indoor-locator"]).unwrap();
        assert_eq!(args.config, "config/site.toml");

        let args = Args::try_parse_from(["indoor-locator", "--config", "config/lab.toml"]).unwrap();
        assert_eq!(args.config, "config/lab.toml");
        std::env::remove_var("CONFIG_FILE");
    }
}
