//! Listener registries and notification delivery
//!
//! Device-based and infrastructure-based estimates go to separate
//! registries. Delivery is synchronous and in registration order; the
//! listener list is snapshotted first so callbacks run without holding the
//! registry lock. Status and progress go to device listeners.

use crate::domain::position::Fix;
use crate::domain::types::{Progress, StatusCode};
use crate::domain::{Estimate, TrackedPosition};
use crate::infra::metrics::Metrics;
use crate::services::state::LocatorState;
use crate::services::tracking::TrackingBuffer;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub trait LocationListener: Send + Sync {
    fn on_location_changed(&self, estimate: &Estimate);

    fn on_status_changed(&self, _status: StatusCode, _message: &str) {}

    fn on_progress(&self, _progress: Progress) {}
}

/// Handle returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Device,
    Infrastructure,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Device => "device",
            Channel::Infrastructure => "infrastructure",
        }
    }
}

type Registry = RwLock<Vec<(ListenerId, Arc<dyn LocationListener>)>>;

pub struct NotificationFanout {
    device: Registry,
    infrastructure: Registry,
    next_id: AtomicU64,
    state: Arc<LocatorState>,
    tracking: Arc<TrackingBuffer>,
    client_id: String,
    metrics: Arc<Metrics>,
}

impl NotificationFanout {
    pub fn new(
        state: Arc<LocatorState>,
        tracking: Arc<TrackingBuffer>,
        client_id: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            device: RwLock::new(Vec::new()),
            infrastructure: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            state,
            tracking,
            client_id,
            metrics,
        }
    }

    fn registry(&self, channel: Channel) -> &Registry {
        match channel {
            Channel::Device => &self.device,
            Channel::Infrastructure => &self.infrastructure,
        }
    }

    fn snapshot(&self, channel: Channel) -> Vec<Arc<dyn LocationListener>> {
        self.registry(channel).read().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn add_listener(&self, channel: Channel, listener: Arc<dyn LocationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry(channel).write().push((id, listener));
        debug!(channel = channel.as_str(), listener = id.0, "listener_added");
        id
    }

    pub fn remove_listener(&self, channel: Channel, id: ListenerId) -> bool {
        let mut listeners = self.registry(channel).write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        self.registry(channel).read().len()
    }

    pub fn notify_device(&self, estimate: &Estimate) {
        self.notify(Channel::Device, estimate);
    }

    pub fn notify_infrastructure(&self, estimate: &Estimate) {
        self.metrics.record_infrastructure_estimate();
        self.notify(Channel::Infrastructure, estimate);
    }

    fn notify(&self, channel: Channel, estimate: &Estimate) {
        for listener in self.snapshot(channel) {
            listener.on_location_changed(estimate);
        }
        self.metrics.record_estimate_delivered();

        if self.state.tracking_allowed() {
            self.tracking.append(TrackedPosition::from_estimate(estimate, &self.client_id));
        }
    }

    pub fn notify_status(&self, status: StatusCode, message: &str) {
        for listener in self.snapshot(Channel::Device) {
            listener.on_status_changed(status, message);
        }
    }

    pub fn notify_progress(&self, progress: Progress) {
        for listener in self.snapshot(Channel::Device) {
            listener.on_progress(progress);
        }
    }

    /// Track an externally obtained fix. Ignored unless tracking is allowed.
    pub fn track_fix(&self, fix: &Fix) -> bool {
        if !self.state.tracking_allowed() {
            return false;
        }
        self.tracking.append(TrackedPosition::from_fix(fix, &self.client_id));
        true
    }
}
