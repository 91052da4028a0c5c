//! Signal-strength measurements aggregated across one or more scans
//!
//! A `MeasurementBuilder` accumulates scans; `finish()` produces an
//! immutable `Measurement`. A new builder starts every cycle.

use crate::domain::types::AccessPointReading;
use serde::Serialize;
use std::collections::BTreeMap;

/// Raw supporting information for an access point
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApInfo {
    pub ssid: Option<String>,
    pub frequency_mhz: Option<u32>,
}

/// All values observed for one access point during a measurement
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApSamples {
    values: Vec<f64>,
    info: ApInfo,
}

impl ApSamples {
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn info(&self) -> &ApInfo {
        &self.info
    }
}

/// Finalized measurement, keyed by access point identifier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurement {
    samples: BTreeMap<String, ApSamples>,
    scans: usize,
}

impl Measurement {
    /// Access point identifiers observed in any of the scans
    pub fn access_points(&self) -> impl Iterator<Item = &str> {
        self.samples.keys().map(|s| s.as_str())
    }

    /// Mean signal strength for an access point
    pub fn mean(&self, bssid: &str) -> Option<f64> {
        self.samples.get(bssid).map(ApSamples::mean)
    }

    pub fn samples(&self, bssid: &str) -> Option<&ApSamples> {
        self.samples.get(bssid)
    }

    /// (bssid, mean dBm) pairs in identifier order
    pub fn means(&self) -> impl Iterator<Item = (&str, f64)> {
        self.samples.iter().map(|(k, v)| (k.as_str(), v.mean()))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of scans folded into this measurement
    pub fn scans(&self) -> usize {
        self.scans
    }
}

/// Mutable accumulator for one measurement cycle
#[derive(Debug, Default)]
pub struct MeasurementBuilder {
    inner: Measurement,
}

impl MeasurementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single value for an access point
    pub fn add_value(&mut self, bssid: &str, rssi: f64, info: ApInfo) {
        let entry = self.inner.samples.entry(bssid.to_string()).or_default();
        entry.values.push(rssi);
        // Latest scan wins for supporting info
        if info.ssid.is_some() || info.frequency_mhz.is_some() {
            entry.info = info;
        }
    }

    /// Fold one complete scan into the measurement
    pub fn add_scan(&mut self, readings: &[AccessPointReading]) {
        for reading in readings {
            let info =
                ApInfo { ssid: reading.ssid.clone(), frequency_mhz: reading.frequency_mhz };
            self.add_value(&reading.bssid, reading.rssi as f64, info);
        }
        self.inner.scans += 1;
    }

    pub fn scans(&self) -> usize {
        self.inner.scans
    }

    pub fn finish(self) -> Measurement {
        self.inner
    }
}
