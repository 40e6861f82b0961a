//! Key-value metrics DAO over any [`StorageBackend`].
//!
//! Each aggregate row is stored as one JSON object at
//! `metrics/{model}/{id}.json`. The model is the schema name, suffixed with
//! the granularity for hour and day roll-ups (`service_call_hour`). [`KvMetricsDao`] implements both
//! [`MetricsDao`] and [`BatchWriter`]; a batch is applied operation by
//! operation, and each row write is atomic at the backend level.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use meridian_core::dao::{BatchWriter, MetricsDao, WriteOp};
use meridian_core::error::MeridianError;
use meridian_core::schema::Entity;
use meridian_core::storage::StorageBackend;
use meridian_core::types::{Downsampling, EntityId};
use meridian_core::Result;

/// Root prefix of all stored aggregates.
pub const METRICS_PREFIX: &str = "metrics";

/// Storage key of one aggregate row.
pub fn row_key(model: &str, id: &EntityId) -> String {
    let id = id.as_str().replace('/', "%2F");
    format!("{METRICS_PREFIX}/{model}/{id}.json")
}

/// Stores entities of type `E` as JSON documents.
pub struct KvMetricsDao<E> {
    backend: Arc<dyn StorageBackend>,
    model: String,
    reads: AtomicU64,
    writes: AtomicU64,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> KvMetricsDao<E> {
    /// Create a DAO writing to `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_model(backend, E::schema().name())
    }

    /// A DAO for the roll-up table of one granularity. Minute rows share the
    /// base table.
    pub fn for_downsampling(backend: Arc<dyn StorageBackend>, granularity: Downsampling) -> Self {
        match granularity {
            Downsampling::Minute => Self::new(backend),
            other => Self::with_model(backend, &format!("{}_{}", E::schema().name(), other.name())),
        }
    }

    fn with_model(backend: Arc<dyn StorageBackend>, model: &str) -> Self {
        Self {
            backend,
            model: model.to_string(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            _entity: PhantomData,
        }
    }

    /// Table name rows are stored under.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Rows read through [`MetricsDao::get`] so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Rows written through [`BatchWriter::execute`] so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Every stored row of this model, in key order.
    pub async fn scan(&self) -> Result<Vec<E>> {
        let prefix = format!("{METRICS_PREFIX}/{}/", self.model);
        let mut rows = Vec::new();
        for key in self.backend.list(&prefix).await? {
            let raw = self.backend.get(&key).await?;
            rows.push(serde_json::from_slice(&raw)?);
        }
        Ok(rows)
    }

    fn prepare(&self, entity: &E) -> Result<(String, EntityId, Bytes)> {
        entity.validate()?;
        let payload = serde_json::to_vec(entity)?;
        Ok((self.model.clone(), entity.id(), Bytes::from(payload)))
    }
}

#[async_trait]
impl<E: Entity> MetricsDao<E> for KvMetricsDao<E> {
    async fn get(&self, id: &EntityId) -> Result<Option<E>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let key = row_key(&self.model, id);
        match self.backend.get(&key).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(MeridianError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn prepare_insert(&self, entity: &E) -> Result<WriteOp> {
        let (model, id, payload) = self.prepare(entity)?;
        Ok(WriteOp::Insert { model, id, payload })
    }

    fn prepare_update(&self, entity: &E) -> Result<WriteOp> {
        let (model, id, payload) = self.prepare(entity)?;
        Ok(WriteOp::Update { model, id, payload })
    }
}

#[async_trait]
impl<E: Entity> BatchWriter for KvMetricsDao<E> {
    async fn execute(&self, ops: Vec<WriteOp>) -> Result<()> {
        let total = ops.len();
        for op in ops {
            let key = row_key(op.model(), op.id());
            self.backend.put(&key, op.payload().clone()).await?;
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        debug!(model = %self.model, rows = total, "Batch executed");
        Ok(())
    }
}
