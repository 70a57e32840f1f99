//! Sample sink boundary.
//!
//! The sink is the persistence side of the ingest pipeline. Inserts are
//! fire-and-forget: the pipeline never consults an outcome, so a sink that
//! can fail reports through its own logging.

use std::sync::Mutex;

use wristlink_core::{BatteryInfo, HeartRateSample, MotionSample, Sample, StepCountSample};

/// Durable recorder of decoded telemetry, one entry point per stream kind.
///
/// Must tolerate concurrent inserts.
pub trait SampleSink: Send + Sync {
    /// Record a heart-rate reading.
    fn insert_heart_rate(&self, sample: HeartRateSample);

    /// Record a running step count.
    fn insert_steps(&self, sample: StepCountSample);

    /// Record a raw motion reading.
    fn insert_motion(&self, sample: MotionSample);

    /// Record a battery snapshot.
    fn insert_battery(&self, info: BatteryInfo);

    /// Route a sample to its per-kind insert.
    fn insert(&self, sample: Sample) {
        match sample {
            Sample::HeartRate(s) => self.insert_heart_rate(s),
            Sample::Steps(s) => self.insert_steps(s),
            Sample::Motion(s) => self.insert_motion(s),
            Sample::Battery(b) => self.insert_battery(b),
        }
    }
}

/// Sink that keeps every sample in memory, in insertion order.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything inserted so far.
    #[must_use]
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of samples inserted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether nothing was inserted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, sample: Sample) {
        match self.samples.lock() {
            Ok(mut samples) => samples.push(sample),
            Err(_) => tracing::error!("memory sink poisoned, dropping sample"),
        }
    }
}

impl SampleSink for MemorySink {
    fn insert_heart_rate(&self, sample: HeartRateSample) {
        self.push(Sample::HeartRate(sample));
    }

    fn insert_steps(&self, sample: StepCountSample) {
        self.push(Sample::Steps(sample));
    }

    fn insert_motion(&self, sample: MotionSample) {
        self.push(Sample::Motion(sample));
    }

    fn insert_battery(&self, info: BatteryInfo) {
        self.push(Sample::Battery(info));
    }
}
