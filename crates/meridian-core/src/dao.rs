//! Storage-facing collaborator traits of the persistence worker.
//!
//! A persistence worker never talks to a storage engine directly. It reads
//! existing rows through [`MetricsDao::get`], turns entities into
//! [`WriteOp`]s with [`MetricsDao::prepare_insert`] /
//! [`MetricsDao::prepare_update`], and hands one cycle's operations to
//! [`BatchWriter::execute`]. Concrete engines implement both traits.

use async_trait::async_trait;
use bytes::Bytes;

use crate::schema::Entity;
use crate::types::EntityId;
use crate::Result;

/// A single prepared write against the metrics store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create the row, or overwrite it if present.
    Insert {
        model: String,
        id: EntityId,
        payload: Bytes,
    },
    /// Replace an existing row.
    Update {
        model: String,
        id: EntityId,
        payload: Bytes,
    },
}

impl WriteOp {
    /// Model the operation targets.
    pub fn model(&self) -> &str {
        match self {
            Self::Insert { model, .. } | Self::Update { model, .. } => model,
        }
    }

    /// Id of the row the operation targets.
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } => id,
        }
    }

    /// Serialized row.
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Insert { payload, .. } | Self::Update { payload, .. } => payload,
        }
    }
}

/// Row-level access to stored aggregates of one entity type.
#[async_trait]
pub trait MetricsDao<E: Entity>: Send + Sync {
    /// Read the stored row for `id`, if any.
    async fn get(&self, id: &EntityId) -> Result<Option<E>>;

    /// Prepare an insert-or-overwrite of `entity`.
    fn prepare_insert(&self, entity: &E) -> Result<WriteOp>;

    /// Prepare an update of an existing row with `entity`.
    fn prepare_update(&self, entity: &E) -> Result<WriteOp>;
}

/// Executes a cycle's worth of prepared writes.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Apply every operation. An error means the batch must be retried.
    async fn execute(&self, ops: Vec<WriteOp>) -> Result<()>;
}
