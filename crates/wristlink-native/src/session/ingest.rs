//! Telemetry fan-in.
//!
//! Every stream listener decodes its payload and pushes the sample onto one
//! shared [`IngestQueue`]; a single worker drains the queue into the sample
//! sink. Pushing never blocks the driver's notification path, and samples of
//! one stream reach the sink in the order the driver delivered them.
//!
//! The queue is bounded. When it is full the [`OverflowPolicy`] decides
//! whether the incoming or the oldest sample is dropped. Sinks may block on
//! disk, so the worker runs each insert on tokio's blocking pool.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use wristlink_core::{decode, now_ms, DecodeError, NotifyPayload, Sample, StreamKind};

use crate::bridge::StreamHandler;
use crate::store::SampleSink;

use super::config::OverflowPolicy;

// ============================================================================
// Subscriptions
// ============================================================================

/// Set of streams whose subscription is enabled.
///
/// Listeners read it on every notification; only the supervisor writes it.
#[derive(Debug, Default)]
pub struct StreamGate {
    enabled: [AtomicBool; 3],
}

impl StreamGate {
    /// Create a gate with every stream disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `stream`.
    pub fn enable(&self, stream: StreamKind) {
        self.enabled[stream.index()].store(true, Ordering::SeqCst);
    }

    /// Disable every stream.
    pub fn disable_all(&self) {
        for flag in &self.enabled {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Whether `stream` is enabled.
    #[must_use]
    pub fn is_enabled(&self, stream: StreamKind) -> bool {
        self.enabled[stream.index()].load(Ordering::SeqCst)
    }

    /// Enabled streams.
    #[must_use]
    pub fn enabled(&self) -> BTreeSet<StreamKind> {
        StreamKind::ALL
            .into_iter()
            .filter(|stream| self.is_enabled(*stream))
            .collect()
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug)]
enum Backlog {
    /// Bounded channel; a full channel rejects the incoming sample
    Channel {
        tx: Mutex<Option<mpsc::Sender<Sample>>>,
        rx: tokio::sync::Mutex<mpsc::Receiver<Sample>>,
    },
    /// Ring buffer that evicts its oldest sample when full
    Ring {
        samples: Mutex<VecDeque<Sample>>,
        ready: Notify,
        closed: AtomicBool,
    },
}

/// Bounded, non-blocking FIFO between listeners and the sink worker.
#[derive(Debug)]
pub struct IngestQueue {
    backlog: Backlog,
    capacity: usize,
    dropped: AtomicU64,
}

impl IngestQueue {
    /// Create a queue holding at most `capacity` samples (minimum 1).
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let backlog = match policy {
            OverflowPolicy::DropNewest => {
                let (tx, rx) = mpsc::channel(capacity);
                Backlog::Channel {
                    tx: Mutex::new(Some(tx)),
                    rx: tokio::sync::Mutex::new(rx),
                }
            }
            OverflowPolicy::DropOldest => Backlog::Ring {
                samples: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                ready: Notify::new(),
                closed: AtomicBool::new(false),
            },
        };

        Self {
            backlog,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a sample. Returns `false` if a sample was dropped.
    pub fn push(&self, sample: Sample) -> bool {
        let accepted = match &self.backlog {
            Backlog::Channel { tx, .. } => match tx.lock() {
                Ok(tx) => tx.as_ref().is_some_and(|tx| tx.try_send(sample).is_ok()),
                Err(_) => {
                    tracing::error!("ingest queue poisoned, dropping sample");
                    false
                }
            },
            Backlog::Ring { samples, ready, closed } => {
                if closed.load(Ordering::SeqCst) {
                    false
                } else {
                    let accepted = match samples.lock() {
                        Ok(mut samples) => {
                            let room = samples.len() < self.capacity;
                            if !room {
                                samples.pop_front();
                            }
                            samples.push_back(sample);
                            room
                        }
                        Err(_) => {
                            tracing::error!("ingest queue poisoned, dropping sample");
                            false
                        }
                    };
                    ready.notify_one();
                    accepted
                }
            }
        };

        if !accepted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // Log the first drop and then every 1000th to keep bursts quiet
            if total == 1 || total % 1000 == 0 {
                tracing::warn!("ingest queue full ({}), {} sample(s) dropped so far", self.capacity, total);
            }
        }
        accepted
    }

    /// Wait for the next sample. Returns `None` once closed and drained.
    ///
    /// Meant for a single consumer.
    pub async fn next(&self) -> Option<Sample> {
        match &self.backlog {
            Backlog::Channel { rx, .. } => rx.lock().await.recv().await,
            Backlog::Ring { samples, ready, closed } => loop {
                if let Some(sample) = samples.lock().ok().and_then(|mut s| s.pop_front()) {
                    return Some(sample);
                }
                if closed.load(Ordering::SeqCst) {
                    return None;
                }
                ready.notified().await;
            },
        }
    }

    #[cfg(test)]
    fn pop(&self) -> Option<Sample> {
        match &self.backlog {
            Backlog::Channel { rx, .. } => rx.try_lock().ok()?.try_recv().ok(),
            Backlog::Ring { samples, .. } => samples.lock().ok()?.pop_front(),
        }
    }

    /// Stop accepting samples; the worker exits after draining.
    pub fn close(&self) {
        match &self.backlog {
            Backlog::Channel { tx, .. } => {
                if let Ok(mut tx) = tx.lock() {
                    tx.take();
                }
            }
            Backlog::Ring { ready, closed, .. } => {
                closed.store(true, Ordering::SeqCst);
                ready.notify_one();
            }
        }
    }

    /// Samples currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.backlog {
            Backlog::Channel { tx, .. } => tx
                .lock()
                .ok()
                .and_then(|tx| tx.as_ref().map(|tx| tx.max_capacity() - tx.capacity()))
                .unwrap_or(0),
            Backlog::Ring { samples, .. } => samples.lock().map(|s| s.len()).unwrap_or(0),
        }
    }

    /// Whether no sample is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples dropped since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Listeners and worker
// ============================================================================

/// Build the listener for `stream`.
///
/// The listener does nothing while the stream's subscription is disabled.
/// A payload that fails to decode is logged loudly and returned to the driver.
pub fn stream_handler(stream: StreamKind, gate: Arc<StreamGate>, queue: Arc<IngestQueue>) -> StreamHandler {
    Arc::new(move |payload: NotifyPayload| -> Result<(), DecodeError> {
        if !gate.is_enabled(stream) {
            tracing::trace!("{} notification while unsubscribed, ignored", stream);
            return Ok(());
        }

        match decode(stream, &payload, now_ms()) {
            Ok(sample) => {
                queue.push(sample);
                Ok(())
            }
            Err(e) => {
                tracing::error!("driver contract violation on {} stream: {}", stream, e);
                Err(e)
            }
        }
    })
}

/// Drain `queue` into `sink` until the queue is closed.
pub fn spawn_ingest_worker(queue: Arc<IngestQueue>, sink: Arc<dyn SampleSink>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = queue.next().await {
            // One insert at a time keeps the delivery order
            let sink = Arc::clone(&sink);
            if let Err(e) = tokio::task::spawn_blocking(move || sink.insert(sample)).await {
                tracing::error!("sample insert did not finish: {}", e);
            }
        }
        tracing::debug!("ingest worker drained and stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySink;
    use std::time::Duration;
    use wristlink_core::StepCountSample;

    fn steps(n: i32) -> Sample {
        Sample::Steps(StepCountSample { timestamp_ms: 0, steps: n })
    }

    fn step_values(samples: &[Sample]) -> Vec<i32> {
        samples
            .iter()
            .filter_map(|s| match s {
                Sample::Steps(s) => Some(s.steps),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_gate_tracks_streams() {
        let gate = StreamGate::new();
        assert!(gate.enabled().is_empty());

        gate.enable(StreamKind::Steps);
        gate.enable(StreamKind::Motion);
        assert!(gate.is_enabled(StreamKind::Steps));
        assert!(!gate.is_enabled(StreamKind::HeartRate));
        assert_eq!(gate.enabled().len(), 2);

        gate.disable_all();
        assert!(gate.enabled().is_empty());
    }

    #[test]
    fn test_drop_newest_policy() {
        let queue = IngestQueue::new(2, OverflowPolicy::DropNewest);
        assert!(queue.push(steps(1)));
        assert!(queue.push(steps(2)));
        assert!(!queue.push(steps(3)));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(step_values(&[queue.pop().unwrap(), queue.pop().unwrap()]), vec![1, 2]);
    }

    #[test]
    fn test_drop_oldest_policy() {
        let queue = IngestQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(steps(1));
        queue.push(steps(2));
        queue.push(steps(3));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(step_values(&[queue.pop().unwrap(), queue.pop().unwrap()]), vec![2, 3]);
    }

    #[test]
    fn test_handler_ignores_disabled_stream() {
        let gate = Arc::new(StreamGate::new());
        let queue = Arc::new(IngestQueue::new(8, OverflowPolicy::DropNewest));
        let handler = stream_handler(StreamKind::Steps, Arc::clone(&gate), Arc::clone(&queue));

        handler(NotifyPayload::Value(10)).unwrap();
        assert!(queue.is_empty());

        gate.enable(StreamKind::Steps);
        handler(NotifyPayload::Value(11)).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_handler_reports_malformed_payload() {
        let gate = Arc::new(StreamGate::new());
        gate.enable(StreamKind::Motion);
        let queue = Arc::new(IngestQueue::new(8, OverflowPolicy::DropNewest));
        let handler = stream_handler(StreamKind::Motion, gate, Arc::clone(&queue));

        let err = handler(NotifyPayload::Bytes(vec![0x01, 0x00])).unwrap_err();
        assert!(matches!(err, DecodeError::ShortPayload { got: 2, .. }));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_worker_preserves_order_and_drains_on_close() {
        let queue = Arc::new(IngestQueue::new(64, OverflowPolicy::DropNewest));
        let sink = Arc::new(MemorySink::new());
        let worker = spawn_ingest_worker(Arc::clone(&queue), sink.clone());

        for n in 0..20 {
            queue.push(steps(n));
        }
        queue.close();
        assert!(!queue.push(steps(99)));

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step_values(&sink.samples()), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_ring_worker_drains_on_close() {
        let queue = Arc::new(IngestQueue::new(4, OverflowPolicy::DropOldest));
        let sink = Arc::new(MemorySink::new());

        for n in 0..6 {
            queue.push(steps(n));
        }
        assert_eq!(queue.len(), 4);
        queue.close();
        assert!(!queue.push(steps(99)));

        let worker = spawn_ingest_worker(Arc::clone(&queue), sink.clone());
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step_values(&sink.samples()), vec![2, 3, 4, 5]);
        assert_eq!(queue.dropped(), 3);
    }

    #[test]
    fn test_pending_count_follows_channel() {
        let queue = IngestQueue::new(8, OverflowPolicy::DropNewest);
        assert!(queue.is_empty());
        queue.push(steps(1));
        queue.push(steps(2));
        assert_eq!(queue.len(), 2);
        queue.pop();
        assert_eq!(queue.len(), 1);
    }
}
