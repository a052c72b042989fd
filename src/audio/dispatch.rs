//! Hand-off from the capture context to the single dispatch worker.
//!
//! The producer side never blocks: it skips batches while no sink is attached,
//! and when the bounded queue is full it evicts the oldest queued batch to make
//! room for the newest. The worker delivers each batch to whichever sink is
//! attached at the moment it is dequeued.

use super::batch::SampleBatch;
use crate::lock_or_recover;
use crate::sink::DataHandler;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bounded wait between shutdown checks in the worker loop.
const WORKER_POLL: Duration = Duration::from_secs(1);
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Single-slot holder for the currently attached data handler.
pub(crate) struct SinkSlot {
    current: Mutex<Arc<DataHandler>>,
    attached: AtomicBool,
}

impl SinkSlot {
    fn new() -> Self {
        Self {
            current: Mutex::new(Arc::new(DataHandler::Discard)),
            attached: AtomicBool::new(false),
        }
    }

    /// Replace the handler, returning the one it evicted.
    fn swap(&self, handler: DataHandler) -> Arc<DataHandler> {
        let attached = handler.is_attached();
        let mut current = lock_or_recover(&self.current, "sink slot");
        let previous = std::mem::replace(&mut *current, Arc::new(handler));
        self.attached.store(attached, Ordering::Release);
        previous
    }

    fn current(&self) -> Arc<DataHandler> {
        lock_or_recover(&self.current, "sink slot").clone()
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct QueueStats {
    submitted: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    init_failures: AtomicU64,
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Batches accepted into the queue.
    pub submitted: u64,
    /// Batches never enqueued because no sink was attached.
    pub skipped: u64,
    /// Batches discarded on overflow.
    pub dropped: u64,
    pub delivered: u64,
    /// Batches whose handler returned an error or panicked.
    pub failed: u64,
    /// Device open/start failures reported to the attached handler.
    pub init_failures: u64,
}

impl QueueStats {
    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            init_failures: self.init_failures.load(Ordering::Relaxed),
        }
    }
}

/// Capture-side handle onto the queue; cheap to clone into a driver callback.
#[derive(Clone)]
pub struct BatchProducer {
    sender: Sender<SampleBatch>,
    overflow: Receiver<SampleBatch>,
    slot: Arc<SinkSlot>,
    stats: Arc<QueueStats>,
}

impl BatchProducer {
    /// Enqueue without blocking. Returns `true` if the batch was queued.
    pub fn submit(&self, batch: SampleBatch) -> bool {
        self.submit_with(|| batch)
    }

    /// Like [`submit`](Self::submit), but only builds the batch when a sink
    /// is attached to receive it.
    pub fn submit_with(&self, build: impl FnOnce() -> SampleBatch) -> bool {
        if !self.slot.is_attached() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.sender.try_send(build()) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(batch)) => {
                if self.overflow.try_recv().is_ok() {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                match self.sender.try_send(batch) {
                    Ok(()) => {
                        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(_) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                }
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Bounded single-consumer queue plus the worker thread that drains it.
pub struct DispatchQueue {
    producer: BatchProducer,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DispatchQueue {
    /// Create the queue and start its consumer loop.
    pub fn spawn(capacity: usize) -> Result<Self> {
        let (mut queue, receiver) = Self::build(capacity);
        let slot = queue.producer.slot.clone();
        let stats = queue.producer.stats.clone();
        let shutdown = queue.shutdown.clone();
        let worker = thread::Builder::new()
            .name("dispatch-worker".to_string())
            .spawn(move || run_worker(receiver, slot, stats, shutdown))
            .context("failed to spawn dispatch worker")?;
        queue.worker = Some(worker);
        Ok(queue)
    }

    fn build(capacity: usize) -> (Self, Receiver<SampleBatch>) {
        let (sender, receiver) = bounded(capacity.max(1));
        let producer = BatchProducer {
            sender,
            overflow: receiver.clone(),
            slot: Arc::new(SinkSlot::new()),
            stats: Arc::new(QueueStats::default()),
        };
        let queue = Self {
            producer,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        };
        (queue, receiver)
    }

    /// Queue with no consumer, so tests can observe what the producer leaves behind.
    #[cfg(test)]
    pub(crate) fn unstarted(capacity: usize) -> (Self, Receiver<SampleBatch>) {
        Self::build(capacity)
    }

    pub fn producer(&self) -> BatchProducer {
        self.producer.clone()
    }

    /// Route subsequent batches to `handler`; `DataHandler::Discard` detaches.
    pub fn accept(&self, handler: DataHandler) {
        let previous = self.producer.slot.swap(handler);
        if previous.is_attached() {
            tracing::debug!("detached sink {}", previous.describe());
        }
    }

    pub fn is_attached(&self) -> bool {
        self.producer.slot.is_attached()
    }

    /// Tell the attached handler that the device failed to initialise.
    pub fn notify_init_fail(&self, message: &str) {
        self.producer
            .stats
            .init_failures
            .fetch_add(1, Ordering::Relaxed);
        self.producer.slot.current().on_init_fail(message);
    }

    /// Batches currently waiting for the worker.
    pub fn pending(&self) -> usize {
        self.producer.sender.len()
    }

    pub fn stats(&self) -> QueueSnapshot {
        self.producer.stats.snapshot()
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    receiver: Receiver<SampleBatch>,
    slot: Arc<SinkSlot>,
    stats: Arc<QueueStats>,
    shutdown: Arc<AtomicBool>,
) {
    let mut reported_drops = 0u64;
    let mut last_report = Instant::now();
    while !shutdown.load(Ordering::Acquire) {
        match receiver.recv_timeout(WORKER_POLL) {
            Ok(batch) => {
                deliver(&slot, &stats, &batch);
                tracing::debug!("dispatch queue has {} items", receiver.len());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let dropped = stats.dropped.load(Ordering::Relaxed);
        if dropped > reported_drops && last_report.elapsed() >= DROP_REPORT_INTERVAL {
            tracing::warn!(
                "dispatch queue overflowed: {} batches dropped ({} total)",
                dropped - reported_drops,
                dropped
            );
            reported_drops = dropped;
            last_report = Instant::now();
        }
    }
    tracing::debug!("dispatch worker stopped");
}

/// Hand one batch to the current handler; failures never escape the worker.
fn deliver(slot: &SinkSlot, stats: &QueueStats, batch: &SampleBatch) {
    let handler = slot.current();
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(batch))) {
        Ok(Ok(())) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(err)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!("dropping batch for {}: {err:#}", handler.describe());
        }
        Err(payload) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            let message = payload
                .downcast_ref::<&str>()
                .map(|text| (*text).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!("data handler {} panicked: {message}", handler.describe());
        }
    }
}
