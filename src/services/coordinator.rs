//! Location service coordinator
//!
//! Owns the shared state and wires the components together:
//! - enable workflow: building list, resolution, radio map (one at a time)
//! - motion-gated scheduler feeding the estimate aggregator
//! - infrastructure poll loop
//! - listener registries and tracking
//!
//! Network failures in the workflows end up as a status code and message
//! on the status channel; nothing is raised to listeners.

use crate::domain::position::{new_client_id, Fix};
use crate::domain::types::{Building, BuildingId, Progress, StatusCode};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::backend::Backend;
use crate::io::motion::{MotionDetector, MotionSample};
use crate::io::scan::{ScanDispatcher, ScanSource};
use crate::services::aggregator::{collect_measurement, EstimateAggregator};
use crate::services::algorithm::PositioningAlgorithm;
use crate::services::fanout::{Channel, ListenerId, LocationListener, NotificationFanout};
use crate::services::infrastructure::InfrastructurePoller;
use crate::services::matcher;
use crate::services::radio_map_cache::RadioMapCache;
use crate::services::scheduler::{PositioningScheduler, ScanSettings, SchedulerGates};
use crate::services::state::LocatorState;
use crate::services::tracking::TrackingBuffer;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Status message when no error occurred
pub const STATUS_OK: &str = "Ok";

pub struct LocationService {
    state: Arc<LocatorState>,
    cache: RadioMapCache,
    fanout: Arc<NotificationFanout>,
    tracking: Arc<TrackingBuffer>,
    scheduler: PositioningScheduler,
    infrastructure: InfrastructurePoller,
    motion: Arc<MotionDetector>,
    scanner: Arc<dyn ScanSource>,
    dispatcher: Arc<ScanDispatcher>,
    metrics: Arc<Metrics>,
    runtime: Handle,

    enabling: AtomicBool,
    generation: AtomicU64,
    resolution_scans: u32,
    resolution_timeout: Duration,
}

impl LocationService {
    /// Build the service. Must be called inside a tokio runtime.
    pub fn new(
        config: &Config,
        backend: Arc<dyn Backend>,
        scanner: Arc<dyn ScanSource>,
        dispatcher: Arc<ScanDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let runtime = Handle::current();
        let state = Arc::new(LocatorState::new());
        state.set_tracking_allowed(config.tracking_enabled());

        let client_id = config.client_id().map(str::to_string).unwrap_or_else(new_client_id);
        let tracking = Arc::new(TrackingBuffer::new(
            config.tracking_flush_count(),
            backend.clone(),
            metrics.clone(),
            runtime.clone(),
        ));
        let fanout =
            Arc::new(NotificationFanout::new(state.clone(), tracking.clone(), client_id, metrics.clone()));

        let gates = Arc::new(SchedulerGates::new());
        let motion = Arc::new(MotionDetector::new(config.motion_noise_threshold(), gates.clone()));
        let scheduler = PositioningScheduler::new(
            scanner.clone(),
            dispatcher.clone(),
            gates,
            config.poll_interval(),
            metrics.clone(),
            runtime.clone(),
        );
        let cache = RadioMapCache::new(
            backend.clone(),
            config.building_list_ttl(),
            config.radio_map_ttl(),
            config.excluded_name_prefixes().to_vec(),
        );
        let infrastructure = InfrastructurePoller::new(backend, fanout.clone(), runtime.clone());

        info!(client_id = %fanout.client_id(), tracking = state.tracking_allowed(), "location_service_created");

        Arc::new(Self {
            state,
            cache,
            fanout,
            tracking,
            scheduler,
            infrastructure,
            motion,
            scanner,
            dispatcher,
            metrics,
            runtime,
            enabling: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            resolution_scans: config.resolution_scans(),
            resolution_timeout: config.resolution_timeout(),
        })
    }

    /// Resolve the building and make its radio map ready.
    ///
    /// Returns None if a workflow is already in flight. The task yields the
    /// final status, which is also broadcast with its message. Once a newer
    /// workflow has started, nothing is broadcast and the task yields the
    /// status that workflow left.
    pub fn enable_positioning(self: &Arc<Self>) -> Option<JoinHandle<StatusCode>> {
        if self.enabling.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            warn!("enable_positioning_rejected: already in progress");
            return None;
        }

        let generation = self.next_generation();
        let service = self.clone();
        Some(self.runtime.spawn(async move {
            let latch = EnableLatch(service.clone());
            let outcome = service.run_enable(generation).await.filter(|_| service.is_current(generation));
            drop(latch);
            service.finish(outcome)
        }))
    }

    async fn run_enable(&self, generation: u64) -> Option<(StatusCode, String)> {
        self.fanout.notify_progress(Progress::DeterminingBuilding);

        let candidates = match self.cache.ensure_building_list().await {
            Ok(candidates) => candidates,
            Err(e) => return Some(self.connection_problem(&e)),
        };

        let measurement = collect_measurement(
            self.scanner.as_ref(),
            &self.dispatcher,
            self.resolution_scans,
            self.resolution_timeout,
        )
        .await;
        if !self.is_current(generation) {
            return None;
        }

        let shallow = matcher::resolve(measurement.as_ref(), &candidates)
            .and_then(|id| candidates.iter().find(|b| b.id == id).cloned());
        let Some(shallow) = shallow else {
            info!(candidates = candidates.len(), "building_not_found");
            return Some((StatusCode::BuildingNotFound, STATUS_OK.to_string()));
        };

        let id = shallow.id;
        self.state.set_status(StatusCode::BuildingFound);
        self.fanout.notify_status(StatusCode::BuildingFound, shallow.display_name());
        self.install_shallow(shallow);

        if !self.cache.radio_map_requires_refresh(id) {
            return Some((StatusCode::RadioMapReady, STATUS_OK.to_string()));
        }

        self.fanout.notify_progress(Progress::DownloadingRadioMap);
        match self.cache.ensure_radio_map(id).await {
            Ok(lookup) => {
                if !self.is_current(generation) {
                    return None;
                }
                self.merge(lookup.building());
                let status =
                    if lookup.was_fetched() { StatusCode::RadioMapDownloaded } else { StatusCode::RadioMapReady };
                Some((status, STATUS_OK.to_string()))
            }
            Err(e) => Some(self.connection_problem(&e)),
        }
    }

    /// Select `id` as the active building and force-fetch its radio map
    pub fn download_radio_map(self: &Arc<Self>, id: BuildingId) -> JoinHandle<StatusCode> {
        let generation = self.next_generation();
        let service = self.clone();
        self.runtime.spawn(async move {
            if let Some(shallow) = service.cache.shallow_building(id) {
                service.install_shallow(shallow);
            }
            service.fanout.notify_progress(Progress::DownloadingRadioMap);

            let outcome = match service.cache.fetch_radio_map(id).await {
                Ok(building) if service.is_current(generation) => {
                    service.merge(&building);
                    Some((StatusCode::RadioMapDownloaded, STATUS_OK.to_string()))
                }
                Ok(_) => None,
                Err(e) => Some(service.connection_problem(&e)).filter(|_| service.is_current(generation)),
            };
            service.finish(outcome)
        })
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        let current = self.generation.load(Ordering::Acquire) == generation;
        if !current {
            info!(generation, "workflow_superseded");
        }
        current
    }

    /// Activate a shallow building, attaching any radio map already held for it
    fn install_shallow(&self, shallow: Building) {
        let building = match self.cache.cached_radio_map(shallow.id) {
            Some(radio_map) => shallow.with_radio_map(radio_map),
            None => shallow,
        };
        self.state.set_active_building(Some(Arc::new(building)));
    }

    /// Replace only the radio map if the active building has this id; otherwise install it
    fn merge(&self, fetched: &Arc<Building>) {
        let merged = match fetched.radio_map.clone() {
            Some(radio_map) => self.state.attach_radio_map(fetched.id, radio_map),
            None => false,
        };
        if !merged {
            self.state.set_active_building(Some(fetched.clone()));
        }
    }

    fn connection_problem(&self, e: &anyhow::Error) -> (StatusCode, String) {
        self.metrics.record_connection_problem();
        error!(error = %format!("{:#}", e), "connection_problem");
        (StatusCode::ConnectionProblem, e.root_cause().to_string())
    }

    fn finish(&self, outcome: Option<(StatusCode, String)>) -> StatusCode {
        match outcome {
            Some((status, message)) => {
                self.state.set_status(status);
                info!(status = %status, code = status.code(), message = %message, "positioning_status");
                self.fanout.notify_status(status, &message);
                status
            }
            None => self.state.status(),
        }
    }

    pub fn is_enabling(&self) -> bool {
        self.enabling.load(Ordering::Acquire)
    }

    pub fn current_status(&self) -> StatusCode {
        self.state.status()
    }

    /// Start motion-gated positioning; returns the settings after clamping
    pub async fn start_positioning(&self, scans_per_measurement: u32, update_interval_ms: u64) -> ScanSettings {
        let settings = ScanSettings::new(scans_per_measurement, update_interval_ms);
        let aggregator = EstimateAggregator::new(
            settings.scans_per_measurement(),
            self.state.clone(),
            self.scheduler.gates().clone(),
            self.metrics.clone(),
        );
        self.scheduler.start(settings, aggregator, self.fanout.clone()).await;
        settings
    }

    pub async fn stop_positioning(&self) -> bool {
        self.scheduler.stop().await
    }

    pub fn is_positioning(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn active_scheduler_loops(&self) -> usize {
        self.scheduler.active_loops()
    }

    /// Feed the movement gate from a sensor channel until it closes
    pub fn attach_motion_feed(&self, samples: mpsc::Receiver<MotionSample>) -> JoinHandle<()> {
        self.runtime.spawn(self.motion.clone().run(samples))
    }

    pub fn on_motion_sample(&self, sample: MotionSample) -> bool {
        self.motion.on_sample(sample)
    }

    pub async fn start_infrastructure_positioning(&self, update_interval_ms: u64) -> Duration {
        self.infrastructure.start(update_interval_ms).await
    }

    pub async fn stop_infrastructure_positioning(&self) -> bool {
        self.infrastructure.stop().await
    }

    pub fn add_listener(&self, channel: Channel, listener: Arc<dyn LocationListener>) -> ListenerId {
        self.fanout.add_listener(channel, listener)
    }

    pub fn remove_listener(&self, channel: Channel, id: ListenerId) -> bool {
        self.fanout.remove_listener(channel, id)
    }

    pub fn set_positioning_algorithm(&self, algorithm: Arc<dyn PositioningAlgorithm>) {
        self.state.set_algorithm(algorithm);
    }

    pub fn set_tracking_allowed(&self, allowed: bool) {
        info!(allowed, "tracking_allowed_set");
        self.state.set_tracking_allowed(allowed);
    }

    pub fn tracking_allowed(&self) -> bool {
        self.state.tracking_allowed()
    }

    pub fn track_fix(&self, fix: &Fix) -> bool {
        self.fanout.track_fix(fix)
    }

    /// Upload whatever is buffered now
    pub fn flush_tracking(&self) -> Option<JoinHandle<()>> {
        self.tracking.flush()
    }

    pub fn client_id(&self) -> &str {
        self.fanout.client_id()
    }

    pub fn available_buildings(&self) -> Arc<Vec<Building>> {
        self.cache.available_buildings()
    }

    pub fn add_available_building(&self, building: Building) {
        self.cache.add_available_building(building);
    }

    pub fn active_building(&self) -> Option<Arc<Building>> {
        self.state.active_building()
    }
}

/// Releases the enable latch when the workflow ends, including by panic
struct EnableLatch(Arc<LocationService>);

impl Drop for EnableLatch {
    fn drop(&mut self) {
        self.0.enabling.store(false, Ordering::Release);
    }
}
