//! The process-wide persistence timer.
//!
//! [`PersistenceTimer`] owns the list of flushable workers and, on every
//! tick, flushes them one at a time in registration order. A worker that
//! errors, panics or exceeds `flush_timeout` is logged and counted; the
//! remaining workers still flush and the timer keeps running.
//!
//! Ticks that fall inside an overrunning cycle are skipped, never queued.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use meridian_core::config::PipelineConfig;
use meridian_core::schema::Entity;
use meridian_core::Result;

use crate::wait_for_cancel;
use crate::worker::{FlushReport, Worker};

/// A unit the timer can flush.
#[async_trait]
pub trait Flushable: Send + Sync {
    /// Name used in logs and summaries.
    fn flush_name(&self) -> &str;

    /// Flush buffered state.
    async fn flush(&self) -> Result<FlushReport>;
}

#[async_trait]
impl<E: Entity> Flushable for Worker<E> {
    fn flush_name(&self) -> &str {
        crate::worker::Inlet::name(self)
    }

    async fn flush(&self) -> Result<FlushReport> {
        Worker::flush(self).await
    }
}

/// Scheduling parameters of the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub period: Duration,
    pub initial_delay: Duration,
    pub flush_timeout: Duration,
}

impl TimerSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            period: config.persistent_period,
            initial_delay: config.persistent_initial_delay,
            flush_timeout: config.flush_timeout,
        }
    }
}

/// Outcome of one persistence cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushSummary {
    pub cycle: u64,
    pub flushed: Vec<String>,
    pub failed: Vec<String>,
    pub report: FlushReport,
    pub elapsed: Duration,
}

/// Timer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimerStats {
    pub cycles: u64,
    pub skipped_ticks: u64,
    pub flush_errors: u64,
    pub last_cycle: Duration,
}

/// Periodically flushes every registered worker.
pub struct PersistenceTimer {
    settings: TimerSettings,
    workers: RwLock<Vec<Arc<dyn Flushable>>>,
    cycle_lock: Mutex<()>,
    cycles: AtomicU64,
    skipped_ticks: AtomicU64,
    flush_errors: AtomicU64,
    last_cycle_micros: AtomicU64,
}

impl PersistenceTimer {
    pub fn new(settings: TimerSettings) -> Self {
        Self {
            settings,
            workers: RwLock::new(Vec::new()),
            cycle_lock: Mutex::new(()),
            cycles: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
            last_cycle_micros: AtomicU64::new(0),
        }
    }

    /// Add a worker. Workers flush in the order they were registered.
    pub fn register(&self, worker: Arc<dyn Flushable>) {
        debug!(worker = worker.flush_name(), "Registered for persistence");
        self.workers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(worker);
    }

    /// Names of registered workers, in flush order.
    pub fn registered(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|w| w.flush_name().to_string())
            .collect()
    }

    pub fn stats(&self) -> TimerStats {
        TimerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
            last_cycle: Duration::from_micros(self.last_cycle_micros.load(Ordering::Relaxed)),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Flushable>> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Run one persistence cycle now. Cycles never overlap.
    pub async fn flush_all(&self) -> FlushSummary {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut summary = FlushSummary {
            cycle,
            ..FlushSummary::default()
        };

        for worker in self.snapshot() {
            let name = worker.flush_name().to_string();
            let flush = AssertUnwindSafe(worker.flush()).catch_unwind();
            let failure = match tokio::time::timeout(self.settings.flush_timeout, flush).await {
                Ok(Ok(Ok(report))) => {
                    summary.report.absorb(report);
                    summary.flushed.push(name);
                    continue;
                }
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(_)) => "flush panicked".to_string(),
                Err(_) => format!("flush exceeded {:?}", self.settings.flush_timeout),
            };
            self.flush_errors.fetch_add(1, Ordering::Relaxed);
            error!(worker = %name, error = %failure, "Persistence flush failed");
            summary.failed.push(name);
        }

        summary.elapsed = started.elapsed();
        self.last_cycle_micros
            .store(summary.elapsed.as_micros() as u64, Ordering::Relaxed);
        debug!(
            cycle,
            flushed = summary.flushed.len(),
            failed = summary.failed.len(),
            written = summary.report.written,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Persistence cycle complete"
        );
        summary
    }

    /// Run the timer loop until the cancellation signal fires.
    pub async fn run(&self, cancel: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.initial_delay) => {}
            _ = wait_for_cancel(&cancel) => return,
        }

        let period = self.settings.period;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "Persistence timer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.flush_all().await;
                    if summary.elapsed > period {
                        let missed = (summary.elapsed.as_nanos() / period.as_nanos().max(1)) as u64;
                        self.skipped_ticks.fetch_add(missed, Ordering::Relaxed);
                    }
                }
                _ = wait_for_cancel(&cancel) => {
                    debug!("Persistence timer stopping");
                    break;
                }
            }
        }
    }
}
