//! The queue-backed worker: one bounded queue, one consumer task.
//!
//! A [`Worker`] owns a bounded `mpsc` queue that many producers write into
//! through [`Inlet::accept`], and a single consumer task that hands each item
//! to an injected [`Processor`]. Behaviour is composed rather than inherited:
//! aggregation and persistence are both plain processors plugged into the
//! same worker.
//!
//! Flush requests travel on a separate control channel that the consumer
//! polls first, so a processor's state is only ever touched by its own
//! consumer task and needs no locking.
//!
//! A retire notice ([`Inlet::retire`]) tells a node that the upstream
//! aggregate for an id was dropped. It travels on the data queue, so it is
//! seen after every snapshot of the old aggregate and before the first
//! snapshot of the new one.
//!
//! Failures never leave the worker. An `Err` from the processor is logged and
//! counted (`rejected` for shape mismatches, `failed` otherwise); a panic is
//! caught and counted as `failed`. The consumer keeps going either way.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use meridian_core::config::{OverflowPolicy, PipelineConfig};
use meridian_core::error::MeridianError;
use meridian_core::schema::Entity;
use meridian_core::types::EntityId;
use meridian_core::Result;

use crate::wait_for_cancel;

/// Capacity of a worker's control channel.
const CONTROL_CAPACITY: usize = 8;

// ---------------------------------------------------------------------------
// Inlet / Downstream
// ---------------------------------------------------------------------------

/// Anything a graph node can forward entities into: workers, remote
/// dispatchers, bridges, probes.
#[async_trait]
pub trait Inlet<E: Entity>: Send + Sync {
    /// Node name, unique within its graph.
    fn name(&self) -> &str;

    /// Hand one entity to this node.
    async fn accept(&self, item: E) -> Result<()>;

    /// The upstream aggregate for `id` was dropped; later entities with this
    /// id start a new running aggregate. Stateless nodes ignore this.
    async fn retire(&self, _id: EntityId) -> Result<()> {
        Ok(())
    }

    /// The node's outgoing edges, or `None` for a terminal node.
    fn downstream(&self) -> Option<&Downstream<E>> {
        None
    }

    /// Stop the node. Nodes without a lifecycle ignore this.
    async fn stop(&self) {}
}

/// The fan-out edges of a node. Every target receives its own clone.
pub struct Downstream<E: Entity> {
    targets: Arc<RwLock<Vec<Arc<dyn Inlet<E>>>>>,
    failed: Arc<AtomicU64>,
}

impl<E: Entity> Clone for Downstream<E> {
    fn clone(&self) -> Self {
        Self {
            targets: Arc::clone(&self.targets),
            failed: Arc::clone(&self.failed),
        }
    }
}

impl<E: Entity> Default for Downstream<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Downstream<E> {
    /// No edges yet.
    pub fn new() -> Self {
        Self {
            targets: Arc::new(RwLock::new(Vec::new())),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Add an edge.
    pub fn connect(&self, target: Arc<dyn Inlet<E>>) {
        let mut targets = self.targets.write().unwrap_or_else(|p| p.into_inner());
        targets.push(target);
    }

    /// Snapshot of the current targets.
    pub fn targets(&self) -> Vec<Arc<dyn Inlet<E>>> {
        self.targets
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether the node has no edges.
    pub fn is_empty(&self) -> bool {
        self.targets().is_empty()
    }

    /// Number of forwards that a target refused.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Send `item` to every target. Refusals are logged and counted.
    pub async fn forward(&self, item: &E) {
        for target in self.targets() {
            if let Err(e) = target.accept(item.clone()).await {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(target = target.name(), error = %e, "Forward failed");
            }
        }
    }

    /// Tell every target that the aggregate for `id` is gone.
    pub async fn retire(&self, id: &EntityId) {
        for target in self.targets() {
            if let Err(e) = target.retire(id.clone()).await {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(target = target.name(), id = %id, error = %e, "Retire notice lost");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Outcome of one flush of a worker's buffered state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Rows handed to storage.
    pub written: usize,
    /// Entities forwarded to next nodes after the write.
    pub forwarded: usize,
    /// Idle entries evicted.
    pub expired: usize,
    /// Entries still buffered after the flush.
    pub pending: usize,
}

impl FlushReport {
    /// Add another report's counts to this one.
    pub fn absorb(&mut self, other: FlushReport) {
        self.written += other.written;
        self.forwarded += other.forwarded;
        self.expired += other.expired;
        self.pending += other.pending;
    }
}

/// The behaviour injected into a [`Worker`].
///
/// Both methods run on the worker's consumer task, never concurrently.
#[async_trait]
pub trait Processor<E: Entity>: Send + 'static {
    /// Handle one dequeued entity.
    async fn on_work(&mut self, item: E, out: &Downstream<E>) -> Result<()>;

    /// Handle a retire notice for `id`.
    async fn on_retire(&mut self, _id: EntityId, _out: &Downstream<E>) -> Result<()> {
        Ok(())
    }

    /// Write out buffered state. Called by the persistence timer and on stop.
    async fn on_flush(&mut self, _out: &Downstream<E>) -> Result<FlushReport> {
        Ok(FlushReport::default())
    }
}

// ---------------------------------------------------------------------------
// Settings and statistics
// ---------------------------------------------------------------------------

/// Queue and lifecycle tuning of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub stop_grace: Duration,
}

impl WorkerSettings {
    /// Settings taken from the pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            capacity: config.queue_capacity,
            overflow: config.overflow,
            stop_grace: config.stop_grace,
        }
    }
}

#[derive(Debug, Default)]
struct WorkerCounters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
}

/// Point-in-time counters of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub worker: String,
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub forward_failed: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub queue_depth: usize,
}

/// Something that reports worker counters.
pub trait StatsSource: Send + Sync {
    fn stats(&self) -> WorkerStatsSnapshot;
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

enum Control {
    Flush(oneshot::Sender<Result<FlushReport>>),
}

enum Envelope<E> {
    Item(E),
    Retire(EntityId),
}

/// A bounded-queue, single-consumer processing unit.
pub struct Worker<E: Entity> {
    name: String,
    settings: WorkerSettings,
    data_tx: mpsc::Sender<Envelope<E>>,
    control_tx: mpsc::Sender<Control>,
    next: Downstream<E>,
    counters: Arc<WorkerCounters>,
    state: AtomicU8,
    cancel_tx: watch::Sender<bool>,
    pending: Mutex<Option<Consumer<E>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Entity> Worker<E> {
    /// Create a worker. Items may be enqueued before [`start`](Self::start);
    /// they are processed once the consumer runs.
    pub fn new(
        name: impl Into<String>,
        settings: WorkerSettings,
        processor: impl Processor<E>,
    ) -> Arc<Self> {
        let name = name.into();
        let (data_tx, data_rx) = mpsc::channel(settings.capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let next = Downstream::new();
        let counters = Arc::new(WorkerCounters::default());

        let consumer = Consumer {
            name: name.clone(),
            processor: Box::new(processor),
            data_rx,
            control_rx,
            next: next.clone(),
            counters: Arc::clone(&counters),
            stop_grace: settings.stop_grace,
            cancel: cancel_rx,
        };

        Arc::new(Self {
            name,
            settings,
            data_tx,
            control_tx,
            next,
            counters,
            state: AtomicU8::new(CREATED),
            cancel_tx,
            pending: Mutex::new(Some(consumer)),
            task: Mutex::new(None),
        })
    }

    /// Create and immediately start a worker.
    pub fn spawn(
        name: impl Into<String>,
        settings: WorkerSettings,
        processor: impl Processor<E>,
    ) -> Arc<Self> {
        let worker = Self::new(name, settings, processor);
        if let Err(e) = worker.start() {
            error!(worker = %worker.name, error = %e, "Worker failed to start");
        }
        worker
    }

    /// Start the consumer task. Must be called within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.state
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| MeridianError::Internal {
                message: format!("worker {} was already started", self.name),
            })?;
        let consumer = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| MeridianError::Internal {
                message: format!("worker {} has no consumer", self.name),
            })?;
        let handle = tokio::spawn(consumer.run());
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        info!(worker = %self.name, capacity = self.settings.capacity, "Worker started");
        Ok(())
    }

    /// Whether new items are still accepted.
    pub fn is_accepting(&self) -> bool {
        matches!(self.state.load(Ordering::SeqCst), CREATED | RUNNING)
    }

    /// Ask the consumer to flush and wait for its report.
    pub async fn flush(&self) -> Result<FlushReport> {
        if self.state.load(Ordering::SeqCst) != RUNNING {
            return Err(self.stopped());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Flush(reply_tx))
            .await
            .map_err(|_| self.stopped())?;
        reply_rx.await.map_err(|_| self.stopped())?
    }

    /// Stop accepting, drain within the grace period, run a final flush,
    /// then terminate the consumer. Idempotent.
    pub async fn shutdown(&self) {
        let prev = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                matches!(s, CREATED | RUNNING).then_some(STOPPING)
            });
        let Ok(prev) = prev else {
            return;
        };
        let _ = self.cancel_tx.send(true);

        if prev == RUNNING {
            let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!(worker = %self.name, error = %e, "Worker consumer task failed");
                }
            }
        } else {
            let consumer = self.pending.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some(mut consumer) = consumer {
                consumer.abandon_queue();
            }
        }

        self.state.store(STOPPED, Ordering::SeqCst);
        info!(worker = %self.name, "Worker stopped");
    }

    /// Queue and lifecycle settings.
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Current counters.
    pub fn stats(&self) -> WorkerStatsSnapshot {
        let c = &self.counters;
        WorkerStatsSnapshot {
            worker: self.name.clone(),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            forward_failed: self.next.failed(),
            flushes: c.flushes.load(Ordering::Relaxed),
            flush_failures: c.flush_failures.load(Ordering::Relaxed),
            queue_depth: self.data_tx.max_capacity() - self.data_tx.capacity(),
        }
    }

    fn stopped(&self) -> MeridianError {
        MeridianError::WorkerStopped {
            worker: self.name.clone(),
        }
    }

    fn full(&self) -> MeridianError {
        MeridianError::QueueFull {
            worker: self.name.clone(),
            capacity: self.settings.capacity,
        }
    }
}

#[async_trait]
impl<E: Entity> Inlet<E> for Worker<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn accept(&self, item: E) -> Result<()> {
        if !self.is_accepting() {
            return Err(self.stopped());
        }
        let item = Envelope::Item(item);
        let sent = match self.settings.overflow {
            OverflowPolicy::Drop => self.data_tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => self.full(),
                TrySendError::Closed(_) => self.stopped(),
            }),
            OverflowPolicy::Block { timeout } => {
                self.data_tx
                    .send_timeout(item, timeout)
                    .await
                    .map_err(|e| match e {
                        SendTimeoutError::Timeout(_) => self.full(),
                        SendTimeoutError::Closed(_) => self.stopped(),
                    })
            }
        };
        match sent {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Retire notices are never shed: they wait for queue space under either
    /// overflow policy, bounded by the stop grace period.
    async fn retire(&self, id: EntityId) -> Result<()> {
        if !self.is_accepting() {
            return Err(self.stopped());
        }
        self.data_tx
            .send_timeout(Envelope::Retire(id), self.settings.stop_grace)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => self.full(),
                SendTimeoutError::Closed(_) => self.stopped(),
            })
    }

    fn downstream(&self) -> Option<&Downstream<E>> {
        Some(&self.next)
    }

    async fn stop(&self) {
        self.shutdown().await;
    }
}

impl<E: Entity> StatsSource for Worker<E> {
    fn stats(&self) -> WorkerStatsSnapshot {
        Worker::stats(self)
    }
}

// ---------------------------------------------------------------------------
// Consumer task
// ---------------------------------------------------------------------------

struct Consumer<E: Entity> {
    name: String,
    processor: Box<dyn Processor<E>>,
    data_rx: mpsc::Receiver<Envelope<E>>,
    control_rx: mpsc::Receiver<Control>,
    next: Downstream<E>,
    counters: Arc<WorkerCounters>,
    stop_grace: Duration,
    cancel: watch::Receiver<bool>,
}

impl<E: Entity> Consumer<E> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => self.handle_control(control).await,
                _ = wait_for_cancel(&self.cancel) => break,
                envelope = self.data_rx.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
            }
        }

        self.drain().await;
        match self.flush().await {
            Ok(report) => debug!(worker = %self.name, ?report, "Final flush complete"),
            Err(e) => error!(worker = %self.name, error = %e, "Final flush failed"),
        }
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Flush(reply) => {
                let result = self.flush().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope<E>) {
        match envelope {
            Envelope::Item(item) => self.process(item).await,
            Envelope::Retire(id) => self.retire(id).await,
        }
    }

    async fn retire(&mut self, id: EntityId) {
        let outcome = AssertUnwindSafe(self.processor.on_retire(id.clone(), &self.next))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.name, id = %id, error = %e, "Retire failed");
            }
            Err(panic) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker = %self.name,
                    panic = %panic_message(panic.as_ref()),
                    "Retire panicked"
                );
            }
        }
    }

    async fn process(&mut self, item: E) {
        let outcome = AssertUnwindSafe(self.processor.on_work(item, &self.next))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) if e.is_shape() => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.name, error = %e, "Record rejected");
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.name, error = %e, "Record processing failed");
            }
            Err(panic) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker = %self.name,
                    panic = %panic_message(panic.as_ref()),
                    "Record processing panicked"
                );
            }
        }
    }

    async fn flush(&mut self) -> Result<FlushReport> {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        let outcome = AssertUnwindSafe(self.processor.on_flush(&self.next))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(MeridianError::StorageFlush {
                worker: self.name.clone(),
                message: format!("flush panicked: {}", panic_message(panic.as_ref())),
            }),
        };
        if result.is_err() {
            self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn drain(&mut self) {
        let deadline = Instant::now() + self.stop_grace;
        let mut drained = 0usize;
        while Instant::now() < deadline {
            match self.data_rx.try_recv() {
                Ok(envelope) => {
                    self.dispatch(envelope).await;
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        if drained > 0 {
            debug!(worker = %self.name, drained, "Drained queue on stop");
        }
        self.abandon_queue();
    }

    /// Close the queue and count whatever is left as dropped.
    fn abandon_queue(&mut self) {
        self.data_rx.close();
        let mut abandoned = 0u64;
        while let Ok(envelope) = self.data_rx.try_recv() {
            if matches!(envelope, Envelope::Item(_)) {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            self.counters.dropped.fetch_add(abandoned, Ordering::Relaxed);
            warn!(worker = %self.name, abandoned, "Queue not drained within grace period");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use meridian_core::telemetry::ServiceCallMetrics;

    struct Recorder {
        seen: Arc<Mutex<Vec<i64>>>,
        flushes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Processor<ServiceCallMetrics> for Recorder {
        async fn on_work(
            &mut self,
            item: ServiceCallMetrics,
            out: &Downstream<ServiceCallMetrics>,
        ) -> Result<()> {
            match item.calls {
                2 => panic!("boom"),
                3 => return Err(MeridianError::shape("service_call", "bad row")),
                4 => {
                    return Err(MeridianError::Internal {
                        message: "nope".into(),
                    })
                }
                _ => {}
            }
            self.seen.lock().unwrap().push(item.calls);
            out.forward(&item).await;
            Ok(())
        }

        async fn on_flush(&mut self, _out: &Downstream<ServiceCallMetrics>) -> Result<FlushReport> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(FlushReport {
                written: 1,
                ..FlushReport::default()
            })
        }
    }

    fn recorder() -> (Recorder, Arc<Mutex<Vec<i64>>>, Arc<AtomicUsize>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let flushes = Arc::new(AtomicUsize::new(0));
        (
            Recorder {
                seen: Arc::clone(&seen),
                flushes: Arc::clone(&flushes),
            },
            seen,
            flushes,
        )
    }

    fn item(calls: i64) -> ServiceCallMetrics {
        let mut m = ServiceCallMetrics::observe(Utc::now(), "svc", 1, 200);
        m.calls = calls;
        m
    }

    fn settings(capacity: usize, overflow: OverflowPolicy) -> WorkerSettings {
        WorkerSettings {
            capacity,
            overflow,
            stop_grace: Duration::from_secs(5),
        }
    }

    fn blocking() -> OverflowPolicy {
        OverflowPolicy::Block {
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (processor, seen, _) = recorder();
        let worker = Worker::spawn("iso", settings(16, blocking()), processor);
        for calls in 1..=5 {
            worker.accept(item(calls)).await.unwrap();
        }
        worker.shutdown().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 5]);
        let stats = worker.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_drop_policy_counts_overflow() {
        let (processor, seen, _) = recorder();
        let worker = Worker::new("drop", settings(2, OverflowPolicy::Drop), processor);
        worker.accept(item(1)).await.unwrap();
        worker.accept(item(5)).await.unwrap();
        let err = worker.accept(item(6)).await.unwrap_err();
        assert!(matches!(err, MeridianError::QueueFull { capacity: 2, .. }));
        assert_eq!(worker.stats().queue_depth, 2);
        assert_eq!(worker.stats().dropped, 1);

        worker.start().unwrap();
        worker.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 5]);
        assert_eq!(worker.stats().enqueued, 2);
    }

    #[tokio::test]
    async fn test_block_policy_times_out() {
        let (processor, _, _) = recorder();
        let policy = OverflowPolicy::Block {
            timeout: Duration::from_millis(50),
        };
        let worker = Worker::new("block", settings(1, policy), processor);
        worker.accept(item(1)).await.unwrap();

        let started = std::time::Instant::now();
        let err = worker.accept(item(1)).await.unwrap_err();
        let waited = started.elapsed();
        assert!(matches!(err, MeridianError::QueueFull { .. }));
        assert!(waited >= Duration::from_millis(40), "waited {waited:?}");
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_and_stop_lifecycle() {
        let (processor, seen, flushes) = recorder();
        let worker = Worker::spawn("life", settings(64, blocking()), processor);
        for _ in 0..10 {
            worker.accept(item(1)).await.unwrap();
        }
        let report = worker.flush().await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        worker.shutdown().await;
        assert_eq!(seen.lock().unwrap().len(), 10);
        assert_eq!(flushes.load(Ordering::SeqCst), 2, "stop runs a final flush");

        assert!(matches!(
            worker.accept(item(1)).await,
            Err(MeridianError::WorkerStopped { .. })
        ));
        assert!(worker.flush().await.is_err());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (processor, _, _) = recorder();
        let worker = Worker::spawn("twice", settings(4, blocking()), processor);
        let err = worker.start().unwrap_err();
        assert!(err.to_string().contains("twice"), "{err}");
        worker.shutdown().await;
    }

    struct Journal {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor<ServiceCallMetrics> for Journal {
        async fn on_work(
            &mut self,
            item: ServiceCallMetrics,
            _out: &Downstream<ServiceCallMetrics>,
        ) -> Result<()> {
            self.events.lock().unwrap().push(format!("item:{}", item.calls));
            Ok(())
        }

        async fn on_retire(
            &mut self,
            id: EntityId,
            _out: &Downstream<ServiceCallMetrics>,
        ) -> Result<()> {
            self.events.lock().unwrap().push(format!("retire:{id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retire_keeps_queue_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let journal = Journal {
            events: Arc::clone(&events),
        };
        let worker = Worker::new("journal", settings(8, OverflowPolicy::Drop), journal);
        let first = item(1);
        worker.accept(first.clone()).await.unwrap();
        worker.retire(first.id()).await.unwrap();
        worker.accept(item(2)).await.unwrap();

        worker.start().unwrap();
        worker.shutdown().await;
        let expected = vec!["item:1".to_string(), format!("retire:{}", first.id()), "item:2".to_string()];
        assert_eq!(*events.lock().unwrap(), expected);
        assert_eq!(worker.stats().processed, 2);
        assert!(worker.retire(first.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_forward_reaches_every_target() {
        let (first, _, _) = recorder();
        let (second, seen_b, _) = recorder();
        let (third, seen_c, _) = recorder();
        let a = Worker::spawn("a", settings(8, blocking()), first);
        let b = Worker::spawn("b", settings(8, blocking()), second);
        let c = Worker::spawn("c", settings(8, blocking()), third);
        a.downstream().unwrap().connect(b.clone());
        a.downstream().unwrap().connect(c.clone());

        a.accept(item(7)).await.unwrap();
        a.shutdown().await;
        b.shutdown().await;
        c.shutdown().await;
        assert_eq!(*seen_b.lock().unwrap(), vec![7]);
        assert_eq!(*seen_c.lock().unwrap(), vec![7]);
    }
}
