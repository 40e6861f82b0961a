//! In-memory aggregation by entity id.
//!
//! [`AggregationProcessor`] keeps one running aggregate per [`EntityId`] and
//! merges every arrival into it with the schema's column rules. The
//! just-updated aggregate is forwarded downstream on every event, so a
//! downstream node sees the running merge (1, 3, 6, ...) rather than the raw
//! records. Aggregates untouched for `idle_ttl` are evicted.
//!
//! An aggregate idle for `idle_ttl` is never merged into again, whether or
//! not a sweep has removed it yet: the next arrival for that id starts a new
//! aggregate. Every eviction is announced to the next nodes with
//! [`Downstream::retire`] before anything of the new aggregate is forwarded,
//! so a downstream stage tracking increments knows the running total
//! restarted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use meridian_core::schema::Entity;
use meridian_core::types::EntityId;
use meridian_core::Result;

use crate::worker::{Downstream, FlushReport, Processor};

/// Projection applied to each record before it is merged.
pub type Transform<E> = Arc<dyn Fn(E) -> E + Send + Sync>;

struct Slot<E> {
    entity: E,
    touched: Instant,
}

/// Merges same-id records and forwards the running aggregate.
pub struct AggregationProcessor<E: Entity> {
    map: HashMap<EntityId, Slot<E>>,
    transform: Option<Transform<E>>,
    idle_ttl: Duration,
    last_sweep: Instant,
    retired: Vec<EntityId>,
}

impl<E: Entity> AggregationProcessor<E> {
    /// Evict aggregates idle for longer than `idle_ttl`.
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            transform: None,
            idle_ttl,
            last_sweep: Instant::now(),
            retired: Vec::new(),
        }
    }

    /// Project every record through `transform` before merging.
    pub fn with_transform(mut self, transform: impl Fn(E) -> E + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Number of live aggregates.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no aggregate is held.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Merge `incoming` and return the updated aggregate.
    ///
    /// A record that does not match the schema is rejected and leaves the
    /// map untouched.
    pub fn aggregate(&mut self, incoming: E) -> Result<E> {
        let incoming = match &self.transform {
            Some(transform) => transform(incoming),
            None => incoming,
        };
        incoming.validate()?;

        let now = Instant::now();
        let id = incoming.id();
        let stale = self
            .map
            .get(&id)
            .is_some_and(|slot| now.duration_since(slot.touched) >= self.idle_ttl);
        if stale {
            self.map.remove(&id);
            self.retired.push(id.clone());
        }

        let updated = match self.map.get_mut(&id) {
            Some(slot) => {
                slot.entity.merge(&incoming)?;
                slot.touched = now;
                slot.entity.clone()
            }
            None => {
                self.map.insert(
                    id,
                    Slot {
                        entity: incoming.clone(),
                        touched: now,
                    },
                );
                incoming
            }
        };
        Ok(updated)
    }

    /// Drop aggregates idle for longer than the TTL. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        self.last_sweep = now;
        let ttl = self.idle_ttl;
        let before = self.map.len();
        let retired = &mut self.retired;
        self.map.retain(|id, slot| {
            let live = now.duration_since(slot.touched) < ttl;
            if !live {
                retired.push(id.clone());
            }
            live
        });
        before - self.map.len()
    }

    /// Ids evicted since the last call, in eviction order.
    pub fn take_retired(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.retired)
    }

    async fn announce_retired(&mut self, out: &Downstream<E>) {
        for id in self.take_retired() {
            out.retire(&id).await;
        }
    }

    fn sweep_due(&self) -> bool {
        self.last_sweep.elapsed() >= self.idle_ttl / 2
    }
}

#[async_trait]
impl<E: Entity> Processor<E> for AggregationProcessor<E> {
    async fn on_work(&mut self, item: E, out: &Downstream<E>) -> Result<()> {
        let updated = self.aggregate(item);
        self.announce_retired(out).await;
        out.forward(&updated?).await;
        if self.sweep_due() {
            let expired = self.sweep();
            if expired > 0 {
                debug!(expired, remaining = self.map.len(), "Evicted idle aggregates");
            }
            self.announce_retired(out).await;
        }
        Ok(())
    }

    async fn on_flush(&mut self, out: &Downstream<E>) -> Result<FlushReport> {
        let expired = self.sweep();
        self.announce_retired(out).await;
        Ok(FlushReport {
            expired,
            pending: self.map.len(),
            ..FlushReport::default()
        })
    }
}
