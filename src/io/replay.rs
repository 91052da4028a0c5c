//! Replay of recorded sensor input from JSON Lines files
//!
//! Scans: each non-empty line is a JSON array of access point readings,
//! `[{"bssid": "00:11:22:33:44:55", "rssi": -61}, ...]`.
//! Motion: each non-empty line is one accelerometer sample,
//! `{"x": 0.1, "y": 9.8, "z": 0.0}`.
//! Both wrap around at the end of the file.

use crate::domain::types::AccessPointReading;
use crate::io::motion::MotionSample;
use crate::io::scan::{ScanDispatcher, ScanReport, ScanSource};
use anyhow::Context;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub struct ReplayScanSource {
    scans: Vec<ScanReport>,
    cursor: Mutex<usize>,
    latency: Duration,
    dispatcher: Arc<ScanDispatcher>,
    runtime: Handle,
}

impl ReplayScanSource {
    /// Create from already-parsed scans. Must be called inside a tokio runtime.
    pub fn new(scans: Vec<ScanReport>, latency: Duration, dispatcher: Arc<ScanDispatcher>) -> Self {
        Self { scans, cursor: Mutex::new(0), latency, dispatcher, runtime: Handle::current() }
    }

    /// Load scans from a JSON Lines file
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        latency: Duration,
        dispatcher: Arc<ScanDispatcher>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scans file {}", path.display()))?;
        let scans = parse_scans(&content)
            .with_context(|| format!("Failed to parse scans file {}", path.display()))?;
        info!(file = %path.display(), scans = scans.len(), "replay_scans_loaded");
        Ok(Self::new(scans, latency, dispatcher))
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    fn next_scan(&self) -> Option<ScanReport> {
        if self.scans.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let scan = self.scans[*cursor].clone();
        *cursor = (*cursor + 1) % self.scans.len();
        Some(scan)
    }
}

impl ScanSource for ReplayScanSource {
    fn start_scan(&self) -> bool {
        let Some(scan) = self.next_scan() else {
            return false;
        };
        let dispatcher = self.dispatcher.clone();
        let latency = self.latency;
        self.runtime.spawn(async move {
            tokio::time::sleep(latency).await;
            dispatcher.deliver(scan);
        });
        true
    }
}

/// Accelerometer feed replaying recorded samples at a fixed rate
pub struct ReplayMotionSource {
    samples: Vec<MotionSample>,
    interval: Duration,
}

impl ReplayMotionSource {
    pub fn new(samples: Vec<MotionSample>, interval: Duration) -> Self {
        Self { samples, interval: interval.max(Duration::from_millis(1)) }
    }

    /// Load samples from a JSON Lines file
    pub fn from_file<P: AsRef<Path>>(path: P, interval: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read motion file {}", path.display()))?;
        let samples = parse_lines::<MotionSample>(&content)
            .with_context(|| format!("Failed to parse motion file {}", path.display()))?;
        info!(file = %path.display(), samples = samples.len(), "replay_motion_loaded");
        Ok(Self::new(samples, interval))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Send one sample per interval until shutdown or until the receiver is gone
    pub async fn run(self, tx: mpsc::Sender<MotionSample>, mut shutdown: watch::Receiver<bool>) {
        if self.samples.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        for sample in self.samples.iter().cycle() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                sent = tx.send(*sample) => {
                    if sent.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("replay_motion_stopped");
    }
}

/// Parse JSON Lines content into scans, skipping blank lines
pub fn parse_scans(content: &str) -> anyhow::Result<Vec<ScanReport>> {
    parse_lines::<Vec<AccessPointReading>>(content)
}

fn parse_lines<T: DeserializeOwned>(content: &str) -> anyhow::Result<Vec<T>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| serde_json::from_str::<T>(line).with_context(|| format!("line {}", idx + 1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Metrics;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_scans_skips_blank_lines() {
        let content = r#"[{"bssid": "a", "rssi": -40}, {"bssid": "b", "rssi": -70, "ssid": "campus"}]

[{"bssid": "a", "rssi": -42}]
"#;
        let scans = parse_scans(content).unwrap();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0][1].ssid.as_deref(), Some("campus"));
        assert_eq!(scans[1][0].rssi, -42);
    }

    #[test]
    fn test_parse_scans_reports_line() {
        let err = parse_scans("[]\nnot json\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_delivers_and_wraps() {
        let dispatcher = Arc::new(ScanDispatcher::new(Arc::new(Metrics::new())));
        let mut sub = dispatcher.register(8);

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"[{{"bssid": "a", "rssi": -40}}]"#).unwrap();
        writeln!(file, r#"[{{"bssid": "b", "rssi": -50}}]"#).unwrap();
        file.flush().unwrap();

        let source =
            ReplayScanSource::from_file(file.path(), Duration::from_millis(200), dispatcher.clone())
                .unwrap();
        assert_eq!(source.len(), 2);

        for expected in ["a", "b", "a"] {
            assert!(source.start_scan());
            let scan = sub.rx.recv().await.unwrap();
            assert_eq!(scan[0].bssid, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_replay_cycles_until_shutdown() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"x": 0.0, "y": 9.8, "z": 0.0}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"x": 1.5, "y": 9.8, "z": 0.2}}"#).unwrap();
        file.flush().unwrap();

        let source = ReplayMotionSource::from_file(file.path(), Duration::from_millis(100)).unwrap();
        assert_eq!(source.len(), 2);

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(source.run(tx, shutdown_rx));

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received[0], MotionSample::new(0.0, 9.8, 0.0));
        assert_eq!(received[1], MotionSample::new(1.5, 9.8, 0.2));
        assert_eq!(received[2], received[0]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_replay_cannot_scan() {
        let dispatcher = Arc::new(ScanDispatcher::new(Arc::new(Metrics::new())));
        let source = ReplayScanSource::new(Vec::new(), Duration::ZERO, dispatcher);
        assert!(!source.start_scan());
    }
}
