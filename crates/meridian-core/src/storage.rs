//! The StorageBackend trait: key/value object storage shared by a cluster.
//!
//! Persisted aggregates (through the key-value DAO) and membership
//! heartbeats are read and written through this trait. Implementations live
//! in `meridian-storage`: a filesystem backend and an in-memory backend.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// A flat key/value object store.
///
/// Keys are `/`-separated paths such as `metrics/service_call/…json` or
/// `_cluster/node_…json`. Implementations must be `Send + Sync` for use
/// across async tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write an object. Overwrites if it already exists.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read an object. Returns [`MeridianError::NotFound`](crate::MeridianError::NotFound)
    /// if the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// List all object keys matching the given prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Does not error if the key does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if an object exists at the given key.
    async fn exists(&self, key: &str) -> Result<bool>;
}
