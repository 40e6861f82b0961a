//! In-process storage backend.
//!
//! [`MemoryBackend`] keeps every object in a `BTreeMap` behind a lock. It is
//! the default for `memory://` nodes and lets tests share one "cluster
//! storage" between several nodes in the same process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

use meridian_core::error::MeridianError;
use meridian_core::storage::StorageBackend;
use meridian_core::Result;

/// A [`StorageBackend`] holding objects in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Bytes>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail until reset. Used to
    /// simulate an unavailable storage engine.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether the backend holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeridianError::storage_msg(format!(
                "write to {key} rejected: backend unavailable"
            )));
        }
        Ok(())
    }
}

fn poisoned() -> MeridianError {
    MeridianError::Internal {
        message: "memory backend lock poisoned".to_string(),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check_writable(key)?;
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), data);
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .map_err(|_| poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| MeridianError::NotFound {
                key: key.to_string(),
            })
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable(key)?;
        self.objects.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().map_err(|_| poisoned())?.contains_key(key))
    }
}
