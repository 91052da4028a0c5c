//! Configuration loading from TOML files
//!
//! The binary picks the file from `--config`, then `CONFIG_FILE`, then
//! `config/dev.toml`. A missing or unparsable file falls back to defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Lowest accepted update interval for either positioning loop
pub const MIN_UPDATE_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the positioning backend; may embed basic-auth credentials
    pub base_url: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositioningConfig {
    #[serde(default = "default_scans_per_measurement")]
    pub scans_per_measurement: u32,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Scheduler polling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-axis accelerometer delta that counts as movement
    #[serde(default = "default_motion_noise_threshold")]
    pub motion_noise_threshold: f32,
    /// Scans used to build the measurement for building resolution
    #[serde(default = "default_resolution_scans")]
    pub resolution_scans: u32,
    #[serde(default = "default_resolution_timeout_secs")]
    pub resolution_timeout_secs: u64,
}

impl Default for PositioningConfig {
    fn default() -> Self {
        Self {
            scans_per_measurement: default_scans_per_measurement(),
            update_interval_ms: default_update_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            motion_noise_threshold: default_motion_noise_threshold(),
            resolution_scans: default_resolution_scans(),
            resolution_timeout_secs: default_resolution_timeout_secs(),
        }
    }
}

fn default_scans_per_measurement() -> u32 {
    2
}

fn default_update_interval_ms() -> u64 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_motion_noise_threshold() -> f32 {
    0.25
}

fn default_resolution_scans() -> u32 {
    2
}

fn default_resolution_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_building_list_ttl_mins")]
    pub building_list_ttl_mins: u64,
    #[serde(default = "default_radio_map_ttl_mins")]
    pub radio_map_ttl_mins: u64,
    /// Buildings whose names start with one of these are never candidates
    #[serde(default = "default_excluded_name_prefixes")]
    pub excluded_name_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            building_list_ttl_mins: default_building_list_ttl_mins(),
            radio_map_ttl_mins: default_radio_map_ttl_mins(),
            excluded_name_prefixes: default_excluded_name_prefixes(),
        }
    }
}

fn default_building_list_ttl_mins() -> u64 {
    180
}

fn default_radio_map_ttl_mins() -> u64 {
    5
}

fn default_excluded_name_prefixes() -> Vec<String> {
    vec!["VERTEX_GRAVEYARD".to_string(), "DUMMY_".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_flush_count")]
    pub flush_count: usize,
    /// Anonymous client id; generated when absent
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { enabled: false, flush_count: default_flush_count(), client_id: None }
    }
}

fn default_flush_count() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfrastructureConfig {
    #[serde(default = "default_infrastructure_interval_ms")]
    pub update_interval_ms: u64,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self { update_interval_ms: default_infrastructure_interval_ms() }
    }
}

fn default_infrastructure_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// JSON Lines file with one scan (array of readings) per line
    #[serde(default = "default_scans_file")]
    pub scans_file: String,
    #[serde(default = "default_scan_latency_ms")]
    pub scan_latency_ms: u64,
    /// JSON Lines file with one accelerometer sample per line; no motion feed when absent
    #[serde(default)]
    pub motion_file: Option<String>,
    #[serde(default = "default_motion_interval_ms")]
    pub motion_interval_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            scans_file: default_scans_file(),
            scan_latency_ms: default_scan_latency_ms(),
            motion_file: None,
            motion_interval_ms: default_motion_interval_ms(),
        }
    }
}

fn default_scans_file() -> String {
    "scans.jsonl".to_string()
}

fn default_scan_latency_ms() -> u64 {
    500
}

fn default_motion_interval_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: 0 }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub positioning: PositioningConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    backend_url: String,
    backend_timeout_ms: u64,
    scans_per_measurement: u32,
    update_interval_ms: u64,
    poll_interval_ms: u64,
    motion_noise_threshold: f32,
    resolution_scans: u32,
    resolution_timeout_secs: u64,
    building_list_ttl_mins: u64,
    radio_map_ttl_mins: u64,
    excluded_name_prefixes: Vec<String>,
    tracking_enabled: bool,
    tracking_flush_count: usize,
    client_id: Option<String>,
    infrastructure_interval_ms: u64,
    replay_scans_file: String,
    replay_scan_latency_ms: u64,
    replay_motion_file: Option<String>,
    replay_motion_interval_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8080/api".to_string(),
            backend_timeout_ms: default_backend_timeout_ms(),
            scans_per_measurement: default_scans_per_measurement(),
            update_interval_ms: default_update_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            motion_noise_threshold: default_motion_noise_threshold(),
            resolution_scans: default_resolution_scans(),
            resolution_timeout_secs: default_resolution_timeout_secs(),
            building_list_ttl_mins: default_building_list_ttl_mins(),
            radio_map_ttl_mins: default_radio_map_ttl_mins(),
            excluded_name_prefixes: default_excluded_name_prefixes(),
            tracking_enabled: false,
            tracking_flush_count: default_flush_count(),
            client_id: None,
            infrastructure_interval_ms: default_infrastructure_interval_ms(),
            replay_scans_file: default_scans_file(),
            replay_scan_latency_ms: default_scan_latency_ms(),
            replay_motion_file: None,
            replay_motion_interval_ms: default_motion_interval_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
            prometheus_port: 0,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            backend_url: toml_config.backend.base_url,
            backend_timeout_ms: toml_config.backend.timeout_ms,
            scans_per_measurement: toml_config.positioning.scans_per_measurement,
            update_interval_ms: toml_config.positioning.update_interval_ms,
            poll_interval_ms: toml_config.positioning.poll_interval_ms,
            motion_noise_threshold: toml_config.positioning.motion_noise_threshold,
            resolution_scans: toml_config.positioning.resolution_scans,
            resolution_timeout_secs: toml_config.positioning.resolution_timeout_secs,
            building_list_ttl_mins: toml_config.cache.building_list_ttl_mins,
            radio_map_ttl_mins: toml_config.cache.radio_map_ttl_mins,
            excluded_name_prefixes: toml_config.cache.excluded_name_prefixes,
            tracking_enabled: toml_config.tracking.enabled,
            tracking_flush_count: toml_config.tracking.flush_count,
            client_id: toml_config.tracking.client_id.filter(|id| !id.is_empty()),
            infrastructure_interval_ms: toml_config.infrastructure.update_interval_ms,
            replay_scans_file: toml_config.replay.scans_file,
            replay_scan_latency_ms: toml_config.replay.scan_latency_ms,
            replay_motion_file: toml_config.replay.motion_file.filter(|f| !f.is_empty()),
            replay_motion_interval_ms: toml_config.replay.motion_interval_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn backend_timeout_ms(&self) -> u64 {
        self.backend_timeout_ms
    }

    pub fn scans_per_measurement(&self) -> u32 {
        self.scans_per_measurement
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.update_interval_ms
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn motion_noise_threshold(&self) -> f32 {
        self.motion_noise_threshold
    }

    pub fn resolution_scans(&self) -> u32 {
        self.resolution_scans
    }

    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_secs(self.resolution_timeout_secs)
    }

    pub fn building_list_ttl(&self) -> Duration {
        Duration::from_secs(self.building_list_ttl_mins * 60)
    }

    pub fn radio_map_ttl(&self) -> Duration {
        Duration::from_secs(self.radio_map_ttl_mins * 60)
    }

    pub fn excluded_name_prefixes(&self) -> &[String] {
        &self.excluded_name_prefixes
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    pub fn tracking_flush_count(&self) -> usize {
        self.tracking_flush_count
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn infrastructure_interval_ms(&self) -> u64 {
        self.infrastructure_interval_ms
    }

    pub fn replay_scans_file(&self) -> &str {
        &self.replay_scans_file
    }

    pub fn replay_scan_latency(&self) -> Duration {
        Duration::from_millis(self.replay_scan_latency_ms)
    }

    pub fn replay_motion_file(&self) -> Option<&str> {
        self.replay_motion_file.as_deref()
    }

    pub fn replay_motion_interval(&self) -> Duration {
        Duration::from_millis(self.replay_motion_interval_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the client id
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    /// Builder method for tests to set the tracking flush threshold
    pub fn with_tracking_flush_count(mut self, count: usize) -> Self {
        self.tracking_flush_count = count;
        self
    }

    /// Builder method for tests to shorten the resolution scan wait
    pub fn with_resolution_timeout_secs(mut self, secs: u64) -> Self {
        self.resolution_timeout_secs = secs;
        self
    }
}
