//! Filesystem-backed storage for solo mode and local development.
//!
//! [`LocalBackend`] maps every key to a file under a base directory. Writes
//! go to a sibling temp file that is renamed into place, so a reader never
//! observes a half-written row or heartbeat.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, instrument};

use meridian_core::error::MeridianError;
use meridian_core::storage::StorageBackend;
use meridian_core::Result;

/// Suffix of in-flight write files; never reported by `list`.
const TMP_SUFFIX: &str = ".tmp";

/// A [`StorageBackend`] backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_dir: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `base_dir`, creating the directory if needed.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await.map_err(|e| {
            MeridianError::storage(
                format!("Failed to create base directory: {}", base_dir.display()),
                e,
            )
        })?;
        debug!(base_dir = %base_dir.display(), "LocalBackend initialised");
        Ok(Self { base_dir })
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == "..") {
            return Err(MeridianError::storage_msg(format!(
                "key '{key}' escapes the storage root"
            )));
        }
        Ok(self.base_dir.join(key))
    }

    /// Return the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                MeridianError::storage(
                    format!("Failed to create parent directories for {}", path.display()),
                    e,
                )
            })?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &data).await.map_err(|e| {
            MeridianError::storage(format!("Failed to write {}", tmp.display()), e)
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            MeridianError::storage(format!("Failed to move {} into place", path.display()), e)
        })?;
        debug!("Put {} bytes to {}", data.len(), key);
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key)?;
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MeridianError::NotFound {
                    key: key.to_string(),
                }
            } else {
                MeridianError::storage(format!("Failed to read {}", path.display()), e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = &self.base_dir;
        let mut results = Vec::new();
        list_recursive(base, base, prefix, &mut results).await?;
        results.sort();
        debug!("Listed {} keys with prefix '{}'", results.len(), prefix);
        Ok(results)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MeridianError::storage(
                format!("Failed to delete {}", path.display()),
                e,
            )),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        fs::try_exists(&path).await.map_err(|e| {
            MeridianError::storage(format!("Failed to stat {}", path.display()), e)
        })
    }
}

/// Recursively list files under `dir` as `/`-separated keys relative to `base`.
async fn list_recursive(
    base: &Path,
    dir: &Path,
    prefix: &str,
    results: &mut Vec<String>,
) -> Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(MeridianError::storage(
                format!("Failed to read directory {}", dir.display()),
                e,
            ))
        }
    };

    while let Some(entry) = entries.next_entry().await.map_err(|e| {
        MeridianError::storage(format!("Failed to read directory entry in {}", dir.display()), e)
    })? {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(|e| {
            MeridianError::storage(format!("Failed to stat {}", path.display()), e)
        })?;
        if file_type.is_dir() {
            Box::pin(list_recursive(base, &path, prefix, results)).await?;
            continue;
        }
        let relative = path.strip_prefix(base).map_err(|e| MeridianError::Internal {
            message: format!("Path prefix strip failed: {e}"),
        })?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        if key.ends_with(TMP_SUFFIX) {
            continue;
        }
        if key.starts_with(prefix) {
            results.push(key);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_backend() -> (LocalBackend, TempDir) {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path().join("data")).await.unwrap();
        (backend, tmp)
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let (backend, _tmp) = test_backend().await;
        backend.put("metrics/m/a.json", Bytes::from("v1")).await.unwrap();
        backend.put("metrics/m/a.json", Bytes::from("v2")).await.unwrap();
        assert_eq!(backend.get("metrics/m/a.json").await.unwrap(), Bytes::from("v2"));
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let (backend, _tmp) = test_backend().await;
        let result = backend.get("metrics/none.json").await;
        assert!(matches!(result, Err(MeridianError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_by_prefix_skips_temp_files() {
        let (backend, _tmp) = test_backend().await;
        backend.put("_cluster/node_a.json", Bytes::from("a")).await.unwrap();
        backend.put("_cluster/node_b.json", Bytes::from("b")).await.unwrap();
        backend.put("metrics/x.json", Bytes::from("x")).await.unwrap();
        std::fs::write(backend.base_dir().join("_cluster/node_c.json.tmp"), "partial").unwrap();

        let keys = backend.list("_cluster/").await.unwrap();
        assert_eq!(keys, vec!["_cluster/node_a.json", "_cluster/node_b.json"]);
        assert_eq!(backend.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let (backend, _tmp) = test_backend().await;
        assert!(!backend.exists("k.json").await.unwrap());
        backend.put("k.json", Bytes::from("data")).await.unwrap();
        assert!(backend.exists("k.json").await.unwrap());
        backend.delete("k.json").await.unwrap();
        backend.delete("k.json").await.unwrap();
        assert!(!backend.exists("k.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let (backend, _tmp) = test_backend().await;
        assert!(backend.put("../escape.json", Bytes::from("x")).await.is_err());
    }
}
