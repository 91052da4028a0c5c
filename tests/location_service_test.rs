//! End-to-end tests for LocationService with in-process fakes

use async_trait::async_trait;
use indoor_locator::domain::position::{Fix, InfrastructureEstimate};
use indoor_locator::domain::types::{
    AbsoluteLocation, AccessPointReading, Building, BuildingId, Progress, RadioMap, StatusCode, Vertex,
    VertexId,
};
use indoor_locator::domain::{Estimate, Provider, TrackedPosition};
use indoor_locator::infra::{Config, Metrics};
use indoor_locator::io::backend::Backend;
use indoor_locator::io::motion::MotionSample;
use indoor_locator::io::scan::{ScanDispatcher, ScanSource};
use indoor_locator::services::{Channel, LocationListener, LocationService};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeBackend {
    list_fetches: AtomicUsize,
    building_fetches: AtomicUsize,
    fail_list: AtomicBool,
    slow_list: AtomicBool,
    uploads: Mutex<Vec<Vec<TrackedPosition>>>,
}

fn vertex(id: i32, lat: f64, fingerprint: &[(&str, f64)]) -> Vertex {
    Vertex {
        id: VertexId(id),
        location: AbsoluteLocation { latitude: lat, longitude: 10.0, altitude: 0.0 },
        fingerprint: fingerprint.iter().map(|(k, v)| (k.to_string(), *v)).collect::<BTreeMap<_, _>>(),
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn fetch_building_list(&self) -> anyhow::Result<Vec<Building>> {
        self.list_fetches.fetch_add(1, Ordering::SeqCst);
        if self.slow_list.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("network unreachable"));
        }
        Ok(vec![
            Building::shallow(BuildingId(99), "DUMMY_test", &["a", "b"]),
            Building::shallow(BuildingId(1), "Library", &["a", "b"]),
            Building::shallow(BuildingId(2), "Annex", &["c"]),
        ])
    }

    async fn fetch_building(&self, id: BuildingId) -> anyhow::Result<Building> {
        self.building_fetches.fetch_add(1, Ordering::SeqCst);
        let map = RadioMap {
            vertices: vec![
                vertex(10, 57.0000, &[("a", -45.0), ("b", -70.0)]),
                vertex(11, 57.0001, &[("a", -70.0), ("b", -45.0)]),
            ],
        };
        // The full record carries a different name; the active record keeps the shallow one
        Ok(Building::shallow(id, "server-name", &[]).with_radio_map(Arc::new(map)))
    }

    async fn upload_tracked_positions(&self, batch: Vec<TrackedPosition>) -> anyhow::Result<()> {
        self.uploads.lock().push(batch);
        Ok(())
    }

    async fn start_infrastructure_positioning(&self, _client_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn poll_infrastructure_position(
        &self,
        _client_id: &str,
    ) -> anyhow::Result<Option<InfrastructureEstimate>> {
        Ok(None)
    }

    async fn stop_infrastructure_positioning(&self, _client_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Scanner whose results arrive immediately with fixed readings
struct FakeScanner {
    dispatcher: Arc<ScanDispatcher>,
    readings: Mutex<Vec<AccessPointReading>>,
    scans: AtomicUsize,
    /// Accept scans but never deliver a result
    silent: AtomicBool,
}

impl ScanSource for FakeScanner {
    fn start_scan(&self) -> bool {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if !self.silent.load(Ordering::SeqCst) {
            self.dispatcher.deliver(self.readings.lock().clone());
        }
        true
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    estimates: Mutex<Vec<Estimate>>,
}

/// Panics on the first progress notification it sees
struct PanickingListener {
    armed: AtomicBool,
}

impl LocationListener for PanickingListener {
    fn on_location_changed(&self, _estimate: &Estimate) {}

    fn on_progress(&self, _progress: Progress) {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("listener failed");
        }
    }
}

impl LocationListener for Recorder {
    fn on_location_changed(&self, estimate: &Estimate) {
        self.estimates.lock().push(estimate.clone());
    }

    fn on_status_changed(&self, status: StatusCode, message: &str) {
        self.events.lock().push(format!("status:{}:{}", status.as_str(), message));
    }

    fn on_progress(&self, progress: Progress) {
        self.events.lock().push(format!("progress:{}", progress.as_str()));
    }
}

struct Harness {
    service: Arc<LocationService>,
    backend: Arc<FakeBackend>,
    scanner: Arc<FakeScanner>,
    recorder: Arc<Recorder>,
    metrics: Arc<Metrics>,
}

fn harness(config: Config, readings: &[(&str, i32)]) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = Arc::new(ScanDispatcher::new(metrics.clone()));
    let scanner = Arc::new(FakeScanner {
        dispatcher: dispatcher.clone(),
        readings: Mutex::new(readings.iter().map(|(b, r)| AccessPointReading::new(b, *r)).collect()),
        scans: AtomicUsize::new(0),
        silent: AtomicBool::new(false),
    });
    let service =
        LocationService::new(&config, backend.clone(), scanner.clone(), dispatcher, metrics.clone());
    let recorder = Arc::new(Recorder::default());
    service.add_listener(Channel::Device, recorder.clone());
    Harness { service, backend, scanner, recorder, metrics }
}

fn library_readings() -> Vec<(&'static str, i32)> {
    vec![("a", -46), ("b", -69)]
}

// =============================================================================
// Enable workflow
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_enable_resolves_building_and_downloads_radio_map() {
    let h = harness(Config::default(), &library_readings());

    let status = h.service.enable_positioning().unwrap().await.unwrap();

    assert_eq!(status, StatusCode::RadioMapDownloaded);
    assert_eq!(h.service.current_status(), StatusCode::RadioMapDownloaded);
    assert!(!h.service.is_enabling());

    let active = h.service.active_building().unwrap();
    assert_eq!(active.id, BuildingId(1));
    assert_eq!(active.display_name(), "Library");
    assert!(active.is_full());

    // Placeholder buildings never become candidates
    assert_eq!(h.service.available_buildings().len(), 2);

    assert_eq!(
        *h.recorder.events.lock(),
        vec![
            "progress:determining_building",
            "status:building_found:Library",
            "progress:downloading_radio_map",
            "status:radio_map_downloaded:Ok",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_enable_within_ttl_uses_cache() {
    let h = harness(Config::default(), &library_readings());

    h.service.enable_positioning().unwrap().await.unwrap();
    tokio::time::advance(Duration::from_secs(60)).await;
    let status = h.service.enable_positioning().unwrap().await.unwrap();

    assert_eq!(status, StatusCode::RadioMapReady);
    assert_eq!(h.backend.list_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.building_fetches.load(Ordering::SeqCst), 1);
    assert!(h.service.active_building().unwrap().is_full());
}

#[tokio::test(start_paused = true)]
async fn test_connection_problem_reports_root_cause() {
    let h = harness(Config::default(), &library_readings());
    h.backend.fail_list.store(true, Ordering::SeqCst);

    let status = h.service.enable_positioning().unwrap().await.unwrap();

    assert_eq!(status, StatusCode::ConnectionProblem);
    assert!(h.service.active_building().is_none());
    assert_eq!(
        h.recorder.events.lock().last().map(String::as_str),
        Some("status:connection_problem:network unreachable")
    );
    assert_eq!(h.metrics.report().connection_problems, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_access_points_give_building_not_found() {
    let h = harness(Config::default(), &[("zz", -50)]);

    let status = h.service.enable_positioning().unwrap().await.unwrap();

    assert_eq!(status, StatusCode::BuildingNotFound);
    assert!(h.service.active_building().is_none());
    assert_eq!(h.backend.building_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_enable_is_rejected() {
    let h = harness(Config::default(), &library_readings());
    h.backend.slow_list.store(true, Ordering::SeqCst);

    let first = h.service.enable_positioning().unwrap();
    tokio::task::yield_now().await;
    assert!(h.service.is_enabling());
    assert!(h.service.enable_positioning().is_none());

    assert_eq!(first.await.unwrap(), StatusCode::RadioMapDownloaded);
    assert!(h.service.enable_positioning().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_manual_download_selects_building() {
    let h = harness(Config::default(), &library_readings());
    h.service.add_available_building(Building::shallow(BuildingId(7), "Workshop", &["w"]));

    let status = h.service.download_radio_map(BuildingId(7)).await.unwrap();

    assert_eq!(status, StatusCode::RadioMapDownloaded);
    let active = h.service.active_building().unwrap();
    assert_eq!(active.id, BuildingId(7));
    assert_eq!(active.display_name(), "Workshop");
    assert!(active.is_full());
}

#[tokio::test(start_paused = true)]
async fn test_manual_download_supersedes_pending_enable() {
    let h = harness(Config::default(), &library_readings());
    h.backend.slow_list.store(true, Ordering::SeqCst);
    h.service.add_available_building(Building::shallow(BuildingId(7), "Workshop", &["w"]));

    let enable = h.service.enable_positioning().unwrap();
    tokio::task::yield_now().await;
    let status = h.service.download_radio_map(BuildingId(7)).await.unwrap();
    assert_eq!(status, StatusCode::RadioMapDownloaded);

    // The list fetch finishes and resolves the library, but its result is dropped
    assert_eq!(enable.await.unwrap(), StatusCode::RadioMapDownloaded);
    assert!(!h.service.is_enabling());
    assert_eq!(h.service.current_status(), StatusCode::RadioMapDownloaded);
    assert_eq!(h.service.active_building().unwrap().id, BuildingId(7));
    assert_eq!(h.backend.building_fetches.load(Ordering::SeqCst), 1);
    assert!(!h.recorder.events.lock().iter().any(|e| e.starts_with("status:building_found")));
}

#[tokio::test(start_paused = true)]
async fn test_superseded_enable_does_not_report_building_not_found() {
    let config = Config::default().with_resolution_timeout_secs(1);
    let h = harness(config, &library_readings());
    h.backend.slow_list.store(true, Ordering::SeqCst);
    h.scanner.silent.store(true, Ordering::SeqCst);
    h.service.add_available_building(Building::shallow(BuildingId(7), "Workshop", &["w"]));

    let enable = h.service.enable_positioning().unwrap();
    tokio::task::yield_now().await;
    h.service.download_radio_map(BuildingId(7)).await.unwrap();

    assert_eq!(enable.await.unwrap(), StatusCode::RadioMapDownloaded);
    assert_eq!(h.service.current_status(), StatusCode::RadioMapDownloaded);
    assert_eq!(h.service.active_building().unwrap().id, BuildingId(7));
    assert_eq!(
        *h.recorder.events.lock(),
        vec![
            "progress:determining_building",
            "progress:downloading_radio_map",
            "status:radio_map_downloaded:Ok",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_panicking_listener_releases_enable_latch() {
    let h = harness(Config::default(), &library_readings());
    h.service.add_listener(Channel::Device, Arc::new(PanickingListener { armed: AtomicBool::new(true) }));

    let first = h.service.enable_positioning().unwrap();
    assert!(first.await.unwrap_err().is_panic());
    assert!(!h.service.is_enabling());

    let status = h.service.enable_positioning().unwrap().await.unwrap();
    assert_eq!(status, StatusCode::RadioMapDownloaded);
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_positioning_estimates_once_until_moved() {
    let h = harness(Config::default(), &library_readings());
    h.service.enable_positioning().unwrap().await.unwrap();
    let resolution_scans = h.scanner.scans.load(Ordering::SeqCst);

    let settings = h.service.start_positioning(2, 500).await;
    assert_eq!(settings.update_interval(), Duration::from_millis(1000));

    tokio::time::sleep(Duration::from_secs(3)).await;
    {
        let estimates = h.recorder.estimates.lock();
        assert_eq!(estimates.len(), 1);
        assert_eq!(estimates[0].vertex_id, Some(VertexId(10)));
        assert_eq!(estimates[0].provider, Provider::DeviceWifi);
    }
    assert_eq!(h.scanner.scans.load(Ordering::SeqCst) - resolution_scans, 2);

    h.service.on_motion_sample(MotionSample::new(0.0, 9.8, 0.0));
    h.service.on_motion_sample(MotionSample::new(1.0, 9.8, 0.0));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.recorder.estimates.lock().len(), 2);

    assert!(h.service.stop_positioning().await);
    assert!(!h.service.is_positioning());
    assert_eq!(h.service.active_scheduler_loops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_motion_feed_reopens_scanning() {
    let h = harness(Config::default(), &library_readings());
    h.service.enable_positioning().unwrap().await.unwrap();

    let (tx, rx) = mpsc::channel(8);
    let feed = h.service.attach_motion_feed(rx);

    h.service.start_positioning(2, 1000).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.recorder.estimates.lock().len(), 1);

    // Jitter below the noise threshold keeps the gate closed
    tx.send(MotionSample::new(0.0, 9.8, 0.0)).await.unwrap();
    tx.send(MotionSample::new(0.1, 9.7, 0.0)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.recorder.estimates.lock().len(), 1);

    tx.send(MotionSample::new(0.9, 9.8, 0.0)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.recorder.estimates.lock().len(), 2);

    drop(tx);
    feed.await.unwrap();
    h.service.stop_positioning().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_leaves_one_loop() {
    let h = harness(Config::default(), &library_readings());
    h.service.enable_positioning().unwrap().await.unwrap();
    let resolution_scans = h.scanner.scans.load(Ordering::SeqCst);

    h.service.start_positioning(2, 3000).await;
    h.service.start_positioning(2, 3000).await;
    assert_eq!(h.service.active_scheduler_loops(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.recorder.estimates.lock().len(), 1);
    assert_eq!(h.scanner.scans.load(Ordering::SeqCst) - resolution_scans, 2);

    h.service.stop_positioning().await;
}

// =============================================================================
// Tracking
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_tracked_positions_upload_in_batches() {
    let config = Config::default().with_tracking_flush_count(2).with_client_id("device-1");
    let h = harness(config, &library_readings());
    assert_eq!(h.service.client_id(), "device-1");
    h.service.enable_positioning().unwrap().await.unwrap();

    // Not tracked while tracking is off
    assert!(!h.service.track_fix(&gps_fix()));

    h.service.set_tracking_allowed(true);
    h.service.start_positioning(2, 3000).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.service.track_fix(&gps_fix()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let uploads = h.backend.uploads.lock();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].len(), 2);
    assert_eq!(uploads[0][0].provider, Provider::DeviceWifi);
    assert_eq!(uploads[0][0].building_id, Some(BuildingId(1)));
    assert_eq!(uploads[0][1].provider, Provider::Gps);
    assert!(uploads[0][1].building_id.is_none());
    assert!(!uploads[0][1].has_bearing);
    assert!(uploads.iter().flatten().all(|p| p.client_id == "device-1"));
    drop(uploads);

    h.service.stop_positioning().await;
}

fn gps_fix() -> Fix {
    Fix {
        provider: Provider::Gps,
        latitude: 57.01,
        longitude: 9.99,
        altitude: 12.0,
        accuracy: Some(6.0),
        bearing: Some(f32::NAN),
        speed: None,
    }
}
