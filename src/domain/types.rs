//! Shared types for the indoor locator

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Newtype wrapper for building IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BuildingId(pub i32);

impl std::fmt::Display for BuildingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for radio map vertex IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VertexId(pub i32);

impl std::fmt::Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One access point as seen by a single wireless scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPointReading {
    /// Access point identifier (BSSID / MAC)
    pub bssid: String,
    /// Received signal strength in dBm
    pub rssi: i32,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub frequency_mhz: Option<u32>,
}

impl AccessPointReading {
    pub fn new(bssid: &str, rssi: i32) -> Self {
        Self { bssid: bssid.to_string(), rssi, ssid: None, frequency_mhz: None }
    }
}

/// WGS84 position of a radio map vertex
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AbsoluteLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

/// A surveyed location in a radio map with its signal fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: VertexId,
    pub location: AbsoluteLocation,
    /// Mean signal strength (dBm) per access point observed at this vertex
    #[serde(default)]
    pub fingerprint: BTreeMap<String, f64>,
}

/// Radio map: the surveyed vertices of a building
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RadioMap {
    #[serde(default)]
    pub vertices: Vec<Vertex>,
}

impl RadioMap {
    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.iter().find(|v| v.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// A building as known to the backend.
///
/// A *shallow* building carries identity, name and permissible access points.
/// A *full* building additionally carries its radio map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    pub id: BuildingId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permissible_aps: Vec<String>,
    #[serde(default)]
    pub radio_map: Option<Arc<RadioMap>>,
}

impl Building {
    /// Create a shallow building
    pub fn shallow(id: BuildingId, name: &str, permissible_aps: &[&str]) -> Self {
        Self {
            id,
            name: Some(name.to_string()),
            permissible_aps: permissible_aps.iter().map(|s| s.to_string()).collect(),
            radio_map: None,
        }
    }

    pub fn with_radio_map(mut self, radio_map: Arc<RadioMap>) -> Self {
        self.radio_map = Some(radio_map);
        self
    }

    pub fn is_full(&self) -> bool {
        self.radio_map.is_some()
    }

    /// True if the name marks a placeholder entry (e.g. "VERTEX_GRAVEYARD", "DUMMY_x")
    pub fn is_placeholder(&self, excluded_prefixes: &[String]) -> bool {
        match &self.name {
            Some(name) => excluded_prefixes.iter().any(|p| name.starts_with(p.as_str())),
            None => false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Outcome codes reported on the status channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    ConnectionProblem,
    RadioMapDownloaded,
    RadioMapNotDownloaded,
    BuildingFound,
    BuildingNotFound,
    RadioMapReady,
}

impl StatusCode {
    pub fn code(&self) -> i8 {
        match self {
            StatusCode::ConnectionProblem => -1,
            StatusCode::RadioMapDownloaded => 0,
            StatusCode::RadioMapNotDownloaded => 1,
            StatusCode::BuildingFound => 2,
            StatusCode::BuildingNotFound => 3,
            StatusCode::RadioMapReady => 4,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -1 => StatusCode::ConnectionProblem,
            0 => StatusCode::RadioMapDownloaded,
            1 => StatusCode::RadioMapNotDownloaded,
            2 => StatusCode::BuildingFound,
            3 => StatusCode::BuildingNotFound,
            4 => StatusCode::RadioMapReady,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::ConnectionProblem => "connection_problem",
            StatusCode::RadioMapDownloaded => "radio_map_downloaded",
            StatusCode::RadioMapNotDownloaded => "radio_map_not_downloaded",
            StatusCode::BuildingFound => "building_found",
            StatusCode::BuildingNotFound => "building_not_found",
            StatusCode::RadioMapReady => "radio_map_ready",
        }
    }

    /// True when the active building has a usable radio map
    pub fn is_ready(&self) -> bool {
        matches!(self, StatusCode::RadioMapDownloaded | StatusCode::RadioMapReady)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a running enable workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    DeterminingBuilding,
    DownloadingRadioMap,
}

impl Progress {
    pub fn as_str(&self) -> &'static str {
        match self {
            Progress::DeterminingBuilding => "determining_building",
            Progress::DownloadingRadioMap => "downloading_radio_map",
        }
    }
}
