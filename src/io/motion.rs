//! Accelerometer input for the movement gate
//!
//! Any axis changing by more than the noise threshold between two
//! consecutive samples counts as movement.

use crate::services::scheduler::SchedulerGates;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One 3-axis accelerometer sample
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct MotionSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl MotionSample {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

pub struct MotionDetector {
    noise_threshold: f32,
    last: Mutex<Option<MotionSample>>,
    gates: Arc<SchedulerGates>,
}

impl MotionDetector {
    pub fn new(noise_threshold: f32, gates: Arc<SchedulerGates>) -> Self {
        Self { noise_threshold, last: Mutex::new(None), gates }
    }

    /// Feed a sample. Returns true if it crossed the noise threshold.
    pub fn on_sample(&self, sample: MotionSample) -> bool {
        let previous = self.last.lock().replace(sample);
        let Some(previous) = previous else {
            return false;
        };

        let dx = (previous.x - sample.x).abs();
        let dy = (previous.y - sample.y).abs();
        let dz = (previous.z - sample.z).abs();
        trace!(dx, dy, dz, "motion_sample");

        let moved = dx > self.noise_threshold || dy > self.noise_threshold || dz > self.noise_threshold;
        if moved {
            self.gates.mark_moved();
        }
        moved
    }

    /// Consume samples from a sensor channel until it closes
    pub async fn run(self: Arc<Self>, mut samples: mpsc::Receiver<MotionSample>) {
        debug!("motion_detector_started");
        while let Some(sample) = samples.recv().await {
            self.on_sample(sample);
        }
        debug!("motion_detector_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> (MotionDetector, Arc<SchedulerGates>) {
        let gates = Arc::new(SchedulerGates::new());
        (MotionDetector::new(0.25, gates.clone()), gates)
    }

    #[test]
    fn test_first_sample_sets_baseline() {
        let (detector, gates) = detector();
        assert!(!detector.on_sample(MotionSample::new(0.0, 9.8, 0.0)));
        assert!(!gates.has_moved());
    }

    #[test]
    fn test_small_jitter_is_ignored() {
        let (detector, gates) = detector();
        detector.on_sample(MotionSample::new(0.0, 9.8, 0.0));
        assert!(!detector.on_sample(MotionSample::new(0.2, 9.6, 0.1)));
        assert!(!gates.has_moved());
    }

    #[test]
    fn test_single_axis_crossing_marks_moved() {
        let (detector, gates) = detector();
        detector.on_sample(MotionSample::new(0.0, 9.8, 0.0));
        assert!(detector.on_sample(MotionSample::new(0.0, 9.8, 0.3)));
        assert!(gates.has_moved());
    }

    #[tokio::test]
    async fn test_run_consumes_channel() {
        let (detector, gates) = detector();
        let detector = Arc::new(detector);
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(detector.clone().run(rx));

        tx.send(MotionSample::new(0.0, 0.0, 0.0)).await.unwrap();
        tx.send(MotionSample::new(1.0, 0.0, 0.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(gates.has_moved());
    }
}
