//! Dirty-set buffering and periodic flush to storage.
//!
//! [`PersistenceProcessor`] does not forward on arrival. It folds each
//! arrival into a dirty set keyed by [`EntityId`] and writes the set out when
//! the persistence timer (or a stop) asks the worker to flush. After a
//! successful write the increment each row gained in that flush is forwarded
//! to the worker's next nodes, which is where export and down-sampling hang
//! off. Increments are independent contributions, so a coarser stage merges
//! them without ever seeing the same call twice.
//!
//! Two settings shape a flush:
//!
//! - `need_merge_db_data = false`: every dirty entity is written as an
//!   insert-or-overwrite; storage is never read.
//! - `need_merge_db_data = true`: the stored row is read first and the
//!   buffered contribution merged into it with the schema's column rules.
//!   This is what lets several independent producers converge on one row.
//!
//! [`Convergence`] says what an arrival means. A running aggregate from a
//! single upstream (`Latest`) replaces the buffered value; an independent
//! contribution (`Merge`) is merged into it. Under `Latest` the last flushed
//! snapshot is kept as a baseline, so the increment since that flush is
//! known; with `need_merge_db_data` only that increment reaches storage.
//!
//! A baseline belongs to one running aggregate. When the upstream drops that
//! aggregate it sends a retire notice; the increment not yet flushed is
//! carried over and the next snapshot starts without a baseline. Idle
//! expiry only removes clean entries and is a memory backstop; it must not
//! fire before the upstream aggregate is itself idle-expired, hence
//! [`PersistenceOptions::from_config`] sets it to twice the aggregation TTL.
//!
//! A failed flush leaves every entry dirty; the next cycle retries it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use meridian_core::config::PipelineConfig;
use meridian_core::dao::{BatchWriter, MetricsDao, WriteOp};
use meridian_core::error::MeridianError;
use meridian_core::schema::{delta, Entity};
use meridian_core::types::EntityId;
use meridian_core::Result;

use crate::worker::{Downstream, FlushReport, Processor};

/// What an arriving entity represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Convergence {
    /// A running aggregate; the newest snapshot per id wins.
    #[default]
    Latest,
    /// An independent contribution, merged by column rules.
    Merge,
}

/// What happens to an entry after it was flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Remove it from the dirty set.
    #[default]
    Remove,
    /// Keep it with every `Add` column zeroed.
    Reset,
}

/// Behaviour of one persistence worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceOptions {
    pub need_merge_db_data: bool,
    pub convergence: Convergence,
    pub retention: Retention,
    /// Clean entries kept for baselines expire after this long without arrivals.
    pub idle_ttl: Duration,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            need_merge_db_data: false,
            convergence: Convergence::Latest,
            retention: Retention::Remove,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

impl PersistenceOptions {
    /// Options whose clean-entry expiry outlives the upstream aggregate.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            idle_ttl: config.aggregation_idle_ttl * 2,
            ..Self::default()
        }
    }

    pub fn need_merge_db_data(mut self, need: bool) -> Self {
        self.need_merge_db_data = need;
        self
    }

    pub fn convergence(mut self, convergence: Convergence) -> Self {
        self.convergence = convergence;
        self
    }

    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

struct DirtyEntry<E> {
    /// Latest snapshot (`Latest`) or merged contributions (`Merge`).
    current: E,
    /// `current` as of the last successful flush, `Latest` only.
    baseline: Option<E>,
    /// Unflushed increments of upstream aggregates that were retired.
    carry: Option<E>,
    /// The upstream aggregate behind `current` was retired.
    retired: bool,
    dirty: bool,
    touched: Instant,
}

impl<E: Entity> DirtyEntry<E> {
    fn new(current: E, now: Instant) -> Self {
        Self {
            current,
            baseline: None,
            carry: None,
            retired: false,
            dirty: true,
            touched: now,
        }
    }

    /// What this entry adds since its last successful flush.
    fn increment(&self, convergence: Convergence) -> Result<E> {
        let mut increment = match (&self.baseline, convergence) {
            (Some(baseline), Convergence::Latest) => delta(&self.current, baseline)?,
            _ => self.current.clone(),
        };
        if let Some(carry) = &self.carry {
            let mut total = carry.clone();
            total.merge(&increment)?;
            increment = total;
        }
        Ok(increment)
    }

    /// Fold the pending increment into `carry` and start a new aggregate.
    fn restart(&mut self, convergence: Convergence, item: E) -> Result<()> {
        self.carry = Some(self.increment(convergence)?);
        self.current = item;
        self.baseline = None;
        self.retired = false;
        Ok(())
    }
}

/// Buffers dirty aggregates and writes them out on flush.
pub struct PersistenceProcessor<E: Entity> {
    name: String,
    dao: Arc<dyn MetricsDao<E>>,
    writer: Arc<dyn BatchWriter>,
    options: PersistenceOptions,
    entries: HashMap<EntityId, DirtyEntry<E>>,
}

impl<E: Entity> PersistenceProcessor<E> {
    /// Create a processor writing through `dao` and `writer`.
    pub fn new(
        name: impl Into<String>,
        dao: Arc<dyn MetricsDao<E>>,
        writer: Arc<dyn BatchWriter>,
        options: PersistenceOptions,
    ) -> Self {
        Self {
            name: name.into(),
            dao,
            writer,
            options,
            entries: HashMap::new(),
        }
    }

    /// Number of entries awaiting a write.
    pub fn dirty_len(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    /// Fold one arrival into the dirty set.
    pub fn absorb(&mut self, item: E) -> Result<()> {
        item.validate()?;
        let now = Instant::now();
        let id = item.id();
        let convergence = self.options.convergence;
        match self.entries.get_mut(&id) {
            Some(entry) => {
                match convergence {
                    Convergence::Latest if entry.retired => entry.restart(convergence, item)?,
                    Convergence::Latest => entry.current = item,
                    Convergence::Merge => entry.current.merge(&item)?,
                }
                entry.dirty = true;
                entry.touched = now;
            }
            None => {
                self.entries.insert(id, DirtyEntry::new(item, now));
            }
        }
        Ok(())
    }

    /// The upstream aggregate for `id` is gone. A clean entry is dropped; a
    /// dirty one is written on the next flush and then dropped.
    pub fn retire(&mut self, id: &EntityId) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.dirty {
            entry.retired = true;
        } else {
            self.entries.remove(id);
        }
    }

    fn expire_idle(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.options.idle_ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.dirty || now.duration_since(e.touched) < ttl);
        before - self.entries.len()
    }

    fn flush_error(&self, e: MeridianError) -> MeridianError {
        match e {
            e @ MeridianError::StorageFlush { .. } => e,
            other => MeridianError::StorageFlush {
                worker: self.name.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Build the write for one dirty entry. Returns the op and the increment
    /// the write adds.
    async fn prepare(&self, entry: &DirtyEntry<E>) -> Result<(WriteOp, E)> {
        let increment = entry.increment(self.options.convergence)?;
        if !self.options.need_merge_db_data {
            let op = self.dao.prepare_insert(&entry.current)?;
            return Ok((op, increment));
        }

        match self.dao.get(&increment.id()).await? {
            Some(mut stored) => {
                stored.merge(&increment)?;
                let op = self.dao.prepare_update(&stored)?;
                Ok((op, increment))
            }
            None => {
                let op = self.dao.prepare_insert(&increment)?;
                Ok((op, increment))
            }
        }
    }

    /// Write every dirty entry in one batch.
    pub async fn flush(&mut self, out: &Downstream<E>) -> Result<FlushReport> {
        let expired = self.expire_idle();
        let ids: Vec<EntityId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, _)| id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(FlushReport {
                expired,
                ..FlushReport::default()
            });
        }

        let mut ops = Vec::with_capacity(ids.len());
        let mut increments = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let (op, increment) = self.prepare(entry).await.map_err(|e| self.flush_error(e))?;
            ops.push(op);
            increments.push(increment);
        }

        let written = ops.len();
        self.writer
            .execute(ops)
            .await
            .map_err(|e| self.flush_error(e))?;

        for id in &ids {
            self.settle(id);
        }
        for increment in &increments {
            out.forward(increment).await;
        }

        let forwarded = if out.is_empty() { 0 } else { increments.len() };
        debug!(worker = %self.name, written, expired, "Flushed dirty set");
        Ok(FlushReport {
            written,
            forwarded,
            expired,
            pending: self.dirty_len(),
        })
    }

    /// Apply the retention policy to a flushed entry.
    fn settle(&mut self, id: &EntityId) {
        let convergence = self.options.convergence;
        let retention = self.options.retention;
        let remove = match self.entries.get_mut(id) {
            None => false,
            Some(entry) if entry.retired => true,
            Some(entry) if convergence == Convergence::Latest => {
                entry.baseline = Some(entry.current.clone());
                entry.carry = None;
                entry.dirty = false;
                false
            }
            Some(entry) => match retention {
                Retention::Remove => true,
                Retention::Reset => {
                    if let Err(e) = entry.current.reset() {
                        warn!(worker = %self.name, id = %id, error = %e, "Reset after flush failed");
                        true
                    } else {
                        entry.dirty = false;
                        false
                    }
                }
            },
        };
        if remove {
            self.entries.remove(id);
        }
    }
}

#[async_trait]
impl<E: Entity> Processor<E> for PersistenceProcessor<E> {
    async fn on_work(&mut self, item: E, _out: &Downstream<E>) -> Result<()> {
        self.absorb(item)
    }

    async fn on_retire(&mut self, id: EntityId, _out: &Downstream<E>) -> Result<()> {
        self.retire(&id);
        Ok(())
    }

    async fn on_flush(&mut self, out: &Downstream<E>) -> Result<FlushReport> {
        self.flush(out).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use meridian_core::storage::StorageBackend;
    use meridian_core::telemetry::ServiceCallMetrics;
    use meridian_storage::{KvMetricsDao, MemoryBackend};

    use crate::aggregation::AggregationProcessor;
    use crate::graph::Probe;

    fn call(calls: i64, status: i32) -> ServiceCallMetrics {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut m = ServiceCallMetrics::observe(ts, "A", calls * 10, status);
        m.calls = calls;
        m
    }

    fn setup(
        options: PersistenceOptions,
    ) -> (
        PersistenceProcessor<ServiceCallMetrics>,
        Arc<KvMetricsDao<ServiceCallMetrics>>,
        Arc<MemoryBackend>,
    ) {
        let backend = Arc::new(MemoryBackend::new());
        let storage: Arc<dyn StorageBackend> = backend.clone();
        let dao = Arc::new(KvMetricsDao::new(storage));
        let processor = PersistenceProcessor::new("persist", dao.clone(), dao.clone(), options);
        (processor, dao, backend)
    }

    async fn stored(dao: &KvMetricsDao<ServiceCallMetrics>) -> ServiceCallMetrics {
        dao.get(&call(1, 200).id()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_latest_snapshot_is_written() {
        let (mut p, dao, _) = setup(PersistenceOptions::default());
        let out = Downstream::new();
        for running in [1, 3, 6] {
            p.absorb(call(running, 200)).unwrap();
        }
        let report = p.flush(&out).await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(stored(&dao).await.calls, 6);
        assert_eq!(dao.reads(), 1, "only the assertion read storage");
        assert_eq!(p.dirty_len(), 0);
    }

    #[tokio::test]
    async fn test_no_merge_overwrites_without_reading() {
        let options = PersistenceOptions::default().convergence(Convergence::Merge);
        let (mut p, dao, _) = setup(options);
        let out = Downstream::new();

        p.absorb(call(5, 200)).unwrap();
        p.flush(&out).await.unwrap();
        p.absorb(call(2, 200)).unwrap();
        p.flush(&out).await.unwrap();

        assert_eq!(dao.reads(), 0);
        assert_eq!(stored(&dao).await.calls, 2);
    }

    #[tokio::test]
    async fn test_merge_with_stored_row() {
        let options = PersistenceOptions::default()
            .need_merge_db_data(true)
            .convergence(Convergence::Merge);
        let (mut p, dao, _) = setup(options);
        let out = Downstream::new();

        p.absorb(call(2, 200)).unwrap();
        p.absorb(call(3, 201)).unwrap();
        p.flush(&out).await.unwrap();
        p.absorb(call(4, 404)).unwrap();
        p.flush(&out).await.unwrap();

        let row = stored(&dao).await;
        assert_eq!(row.calls, 9);
        assert_eq!(row.last_status, 404);
    }

    #[tokio::test]
    async fn test_latest_with_baseline_writes_increments() {
        let options = PersistenceOptions::default().need_merge_db_data(true);
        let (mut p, dao, _) = setup(options);
        let out = Downstream::new();

        p.absorb(call(1, 200)).unwrap();
        p.absorb(call(3, 200)).unwrap();
        p.flush(&out).await.unwrap();
        assert_eq!(stored(&dao).await.calls, 3);

        // A second producer already stored 10 for the same id.
        let mut other = stored(&dao).await;
        other.calls += 10;
        dao.execute(vec![dao.prepare_update(&other).unwrap()]).await.unwrap();

        p.absorb(call(6, 200)).unwrap();
        p.flush(&out).await.unwrap();
        assert_eq!(stored(&dao).await.calls, 16);

        // Nothing dirty: no write, no read.
        let reads = dao.reads();
        let report = p.flush(&out).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(dao.reads(), reads);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_entries_dirty() {
        let (mut p, dao, backend) = setup(PersistenceOptions::default());
        let out = Downstream::new();
        p.absorb(call(4, 200)).unwrap();

        backend.set_fail_writes(true);
        let err = p.flush(&out).await.unwrap_err();
        assert!(matches!(err, MeridianError::StorageFlush { .. }), "{err}");
        assert_eq!(p.dirty_len(), 1);

        p.absorb(call(7, 200)).unwrap();
        backend.set_fail_writes(false);
        p.flush(&out).await.unwrap();
        assert_eq!(stored(&dao).await.calls, 7);
    }

    #[tokio::test]
    async fn test_reset_retention_keeps_identity() {
        let options = PersistenceOptions::default()
            .convergence(Convergence::Merge)
            .retention(Retention::Reset);
        let (mut p, dao, _) = setup(options);
        let out = Downstream::new();
        p.absorb(call(3, 500)).unwrap();
        p.flush(&out).await.unwrap();
        assert_eq!(p.dirty_len(), 0);

        p.absorb(call(1, 200)).unwrap();
        p.flush(&out).await.unwrap();
        let row = stored(&dao).await;
        assert_eq!(row.calls, 1, "Add columns restart after a reset");
        assert_eq!(row.last_status, 200);
    }

    #[tokio::test]
    async fn test_independent_producers_converge_in_either_order() {
        let cases = [
            (Convergence::Latest, [[1, 3], [2, 5]], [6, 9]),
            (Convergence::Merge, [[1, 2], [2, 3]], [3, 4]),
        ];
        for (convergence, first_round, second_round) in cases {
            for a_first in [true, false] {
                let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
                let dao = Arc::new(KvMetricsDao::<ServiceCallMetrics>::new(storage));
                let options = PersistenceOptions::default()
                    .need_merge_db_data(true)
                    .convergence(convergence);
                let mut a = PersistenceProcessor::new("a", dao.clone(), dao.clone(), options);
                let mut b = PersistenceProcessor::new("b", dao.clone(), dao.clone(), options);
                let out = Downstream::new();

                for calls in first_round[0] {
                    a.absorb(call(calls, 200)).unwrap();
                }
                for calls in first_round[1] {
                    b.absorb(call(calls, 200)).unwrap();
                }
                let (first, second) = if a_first { (&mut a, &mut b) } else { (&mut b, &mut a) };
                first.flush(&out).await.unwrap();
                second.flush(&out).await.unwrap();
                let row = stored(&dao).await;
                assert_eq!(row.calls, 8, "{convergence:?}, a first: {a_first}");
                assert_eq!(row.total_latency_ms, 80);

                a.absorb(call(second_round[0], 200)).unwrap();
                b.absorb(call(second_round[1], 200)).unwrap();
                let (first, second) = if a_first { (&mut a, &mut b) } else { (&mut b, &mut a) };
                first.flush(&out).await.unwrap();
                second.flush(&out).await.unwrap();
                assert_eq!(stored(&dao).await.calls, 15, "{convergence:?}, a first: {a_first}");
            }
        }
    }

    fn feed(
        agg: &mut AggregationProcessor<ServiceCallMetrics>,
        p: &mut PersistenceProcessor<ServiceCallMetrics>,
        calls: i64,
    ) {
        let snapshot = agg.aggregate(call(calls, 200)).unwrap();
        for id in agg.take_retired() {
            p.retire(&id);
        }
        p.absorb(snapshot).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_outlives_upstream_aggregate() {
        let config = PipelineConfig::new("memory://");
        let ttl = config.aggregation_idle_ttl;
        let options = PersistenceOptions::from_config(&config).need_merge_db_data(true);
        let (mut p, dao, _) = setup(options);
        let mut agg = AggregationProcessor::new(ttl);
        let out = Downstream::new();

        feed(&mut agg, &mut p, 1);
        p.flush(&out).await.unwrap();
        tokio::time::advance(ttl * 2 / 3).await;
        p.flush(&out).await.unwrap();
        feed(&mut agg, &mut p, 1);
        p.flush(&out).await.unwrap();
        assert_eq!(stored(&dao).await.calls, 2, "two calls stored once each");

        // The upstream aggregate goes idle and restarts from zero.
        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        feed(&mut agg, &mut p, 1);
        p.flush(&out).await.unwrap();
        assert_eq!(stored(&dao).await.calls, 3);

        // Restart while an increment is still unflushed.
        feed(&mut agg, &mut p, 1);
        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        feed(&mut agg, &mut p, 4);
        p.flush(&out).await.unwrap();
        assert_eq!(stored(&dao).await.calls, 8);

        // Retired with nothing newer: written once, then dropped.
        feed(&mut agg, &mut p, 2);
        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        agg.sweep();
        for id in agg.take_retired() {
            p.retire(&id);
        }
        p.flush(&out).await.unwrap();
        assert_eq!(stored(&dao).await.calls, 10);
        assert!(p.entries.is_empty());
    }

    #[tokio::test]
    async fn test_flush_forwards_increments() {
        let (mut p, dao, _) = setup(PersistenceOptions::default().need_merge_db_data(true));
        let tap = Probe::new("tap");
        let out = Downstream::new();
        out.connect(tap.clone());

        p.absorb(call(1, 200)).unwrap();
        p.absorb(call(3, 200)).unwrap();
        let report = p.flush(&out).await.unwrap();
        assert_eq!(report.forwarded, 1);
        p.absorb(call(6, 200)).unwrap();
        p.flush(&out).await.unwrap();

        let forwarded: Vec<i64> = tap.seen().iter().map(|m| m.calls).collect();
        assert_eq!(forwarded, vec![3, 3]);
        assert_eq!(stored(&dao).await.calls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_baselines_expire() {
        let options = PersistenceOptions {
            idle_ttl: Duration::from_secs(30),
            ..PersistenceOptions::default().need_merge_db_data(true)
        };
        let (mut p, _, _) = setup(options);
        let out = Downstream::new();
        p.absorb(call(1, 200)).unwrap();
        p.flush(&out).await.unwrap();
        assert_eq!(p.entries.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = p.flush(&out).await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(p.entries.is_empty());
    }
}
