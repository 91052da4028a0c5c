//! Building list and radio map cache
//!
//! Two independently aged resources:
//! - the shallow building list (one timestamp for the whole list)
//! - full buildings with radio maps (one timestamp per building id)
//!
//! A resource needs refreshing when it was never fetched or its age has
//! reached its TTL. Refreshes of the same resource are serialized and
//! staleness is re-checked once the refresh lock is held, so concurrent
//! callers share one fetch.

use crate::domain::types::{Building, BuildingId, RadioMap};
use crate::io::backend::Backend;
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct CachedBuilding {
    building: Arc<Building>,
    fetched_at: Instant,
}

/// Result of asking for a building's radio map
#[derive(Debug, Clone)]
pub enum RadioMapLookup {
    /// Within TTL, no network access
    Cached(Arc<Building>),
    /// Fetched from the backend just now
    Fetched(Arc<Building>),
}

impl RadioMapLookup {
    pub fn building(&self) -> &Arc<Building> {
        match self {
            RadioMapLookup::Cached(b) | RadioMapLookup::Fetched(b) => b,
        }
    }

    pub fn was_fetched(&self) -> bool {
        matches!(self, RadioMapLookup::Fetched(_))
    }
}

pub struct RadioMapCache {
    backend: Arc<dyn Backend>,
    building_list_ttl: Duration,
    radio_map_ttl: Duration,
    excluded_prefixes: Vec<String>,

    buildings: RwLock<Arc<Vec<Building>>>,
    list_fetched_at: Mutex<Option<Instant>>,
    full_buildings: RwLock<FxHashMap<BuildingId, CachedBuilding>>,

    list_refresh: tokio::sync::Mutex<()>,
    map_refresh: Mutex<FxHashMap<BuildingId, Arc<tokio::sync::Mutex<()>>>>,
}

impl RadioMapCache {
    pub fn new(
        backend: Arc<dyn Backend>,
        building_list_ttl: Duration,
        radio_map_ttl: Duration,
        excluded_prefixes: Vec<String>,
    ) -> Self {
        Self {
            backend,
            building_list_ttl,
            radio_map_ttl,
            excluded_prefixes,
            buildings: RwLock::new(Arc::new(Vec::new())),
            list_fetched_at: Mutex::new(None),
            full_buildings: RwLock::new(FxHashMap::default()),
            list_refresh: tokio::sync::Mutex::new(()),
            map_refresh: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn building_list_requires_refresh(&self) -> bool {
        match *self.list_fetched_at.lock() {
            Some(at) => at.elapsed() >= self.building_list_ttl,
            None => true,
        }
    }

    pub fn radio_map_requires_refresh(&self, id: BuildingId) -> bool {
        match self.full_buildings.read().get(&id) {
            Some(entry) => entry.fetched_at.elapsed() >= self.radio_map_ttl,
            None => true,
        }
    }

    /// Candidate buildings, re-fetched when stale. Placeholders are filtered out.
    pub async fn ensure_building_list(&self) -> anyhow::Result<Arc<Vec<Building>>> {
        let _refresh = self.list_refresh.lock().await;
        if !self.building_list_requires_refresh() {
            return Ok(self.available_buildings());
        }

        let fetched = self
            .backend
            .fetch_building_list()
            .await
            .context("Failed to fetch building list")?;
        let total = fetched.len();
        let buildings: Vec<Building> =
            fetched.into_iter().filter(|b| !b.is_placeholder(&self.excluded_prefixes)).collect();

        info!(buildings = buildings.len(), filtered = total - buildings.len(), "building_list_refreshed");
        let buildings = Arc::new(buildings);
        *self.buildings.write() = buildings.clone();
        *self.list_fetched_at.lock() = Some(Instant::now());
        Ok(buildings)
    }

    /// Full building for `id`, fetched only when its radio map is stale
    pub async fn ensure_radio_map(&self, id: BuildingId) -> anyhow::Result<RadioMapLookup> {
        let lock = self.refresh_lock(id);
        let _refresh = lock.lock().await;
        if let Some(building) = self.fresh_building(id) {
            debug!(building_id = %id, "radio_map_cache_hit");
            return Ok(RadioMapLookup::Cached(building));
        }
        self.fetch_locked(id).await.map(RadioMapLookup::Fetched)
    }

    /// Fetch the full building regardless of age
    pub async fn fetch_radio_map(&self, id: BuildingId) -> anyhow::Result<Arc<Building>> {
        let lock = self.refresh_lock(id);
        let _refresh = lock.lock().await;
        self.fetch_locked(id).await
    }

    async fn fetch_locked(&self, id: BuildingId) -> anyhow::Result<Arc<Building>> {
        let building = self
            .backend
            .fetch_building(id)
            .await
            .with_context(|| format!("Failed to fetch building {}", id))?;
        if building.radio_map.is_none() {
            anyhow::bail!("Building {} has no radio map", id);
        }

        let building = Arc::new(building);
        self.full_buildings
            .write()
            .insert(id, CachedBuilding { building: building.clone(), fetched_at: Instant::now() });
        info!(
            building_id = %id,
            vertices = building.radio_map.as_ref().map(|m| m.vertices.len()).unwrap_or(0),
            "radio_map_fetched"
        );
        Ok(building)
    }

    fn fresh_building(&self, id: BuildingId) -> Option<Arc<Building>> {
        let full = self.full_buildings.read();
        let entry = full.get(&id)?;
        (entry.fetched_at.elapsed() < self.radio_map_ttl).then(|| entry.building.clone())
    }

    fn refresh_lock(&self, id: BuildingId) -> Arc<tokio::sync::Mutex<()>> {
        self.map_refresh.lock().entry(id).or_default().clone()
    }

    /// Radio map held for `id`, whatever its age
    pub fn cached_radio_map(&self, id: BuildingId) -> Option<Arc<RadioMap>> {
        self.full_buildings.read().get(&id).and_then(|e| e.building.radio_map.clone())
    }

    pub fn available_buildings(&self) -> Arc<Vec<Building>> {
        self.buildings.read().clone()
    }

    pub fn shallow_building(&self, id: BuildingId) -> Option<Building> {
        self.buildings.read().iter().find(|b| b.id == id).cloned()
    }

    /// Add or replace a candidate building without touching the list's age
    pub fn add_available_building(&self, building: Building) {
        let mut buildings = self.buildings.write();
        let mut updated = buildings.as_ref().clone();
        match updated.iter_mut().find(|b| b.id == building.id) {
            Some(existing) => *existing = building,
            None => updated.push(building),
        }
        *buildings = Arc::new(updated);
    }
}
