//! Heartbeat-based cluster membership.
//!
//! Each node writes a heartbeat file to the shared storage backend at a
//! regular interval. The [`ClusterViewBuilder`] polls the heartbeat prefix,
//! classifies every node by heartbeat age and feeds the addresses of alive
//! nodes to the [`RemoteClientManager`], which re-derives ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use meridian_core::config::PipelineConfig;
use meridian_core::storage::StorageBackend;
use meridian_core::types::{NodeId, PeerAddress};
use meridian_core::Result;

use crate::remote::manager::RemoteClientManager;
use crate::wait_for_cancel;

/// Storage prefix holding heartbeat files.
pub const HEARTBEAT_PREFIX: &str = "_cluster/";

fn heartbeat_key(node_id: &NodeId) -> String {
    format!("{HEARTBEAT_PREFIX}node_{node_id}.json")
}

// ---------------------------------------------------------------------------
// Heartbeat data structures
// ---------------------------------------------------------------------------

/// Load figures published with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatLoad {
    pub workers: usize,
    pub queue_depth: usize,
    pub dropped: u64,
}

/// A heartbeat written by a node to shared storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub remote_address: PeerAddress,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub load: HeartbeatLoad,
}

/// Produces the current load figures of the local node.
pub type LoadProbe = Arc<dyn Fn() -> HeartbeatLoad + Send + Sync>;

// ---------------------------------------------------------------------------
// HeartbeatWriter
// ---------------------------------------------------------------------------

/// Writes the local node's heartbeat at a regular interval.
pub struct HeartbeatWriter {
    storage: Arc<dyn StorageBackend>,
    node_id: NodeId,
    remote_address: PeerAddress,
    interval: Duration,
    version: AtomicU64,
    load: LoadProbe,
}

impl HeartbeatWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &PipelineConfig, load: LoadProbe) -> Self {
        Self {
            storage,
            node_id: config.node_id.clone(),
            remote_address: config.remote_address.clone(),
            interval: config.heartbeat_interval,
            version: AtomicU64::new(0),
            load,
        }
    }

    pub fn collect_heartbeat(&self) -> Heartbeat {
        Heartbeat {
            node_id: self.node_id.as_str().to_string(),
            remote_address: self.remote_address.clone(),
            timestamp: Utc::now(),
            version: self.version.fetch_add(1, Ordering::Relaxed) + 1,
            load: (self.load)(),
        }
    }

    /// Write a single heartbeat.
    pub async fn write_once(&self) -> Result<()> {
        let heartbeat = self.collect_heartbeat();
        let json = serde_json::to_vec_pretty(&heartbeat)?;
        self.storage
            .put(&heartbeat_key(&self.node_id), json.into())
            .await
    }

    /// Write heartbeats until cancelled. The first one goes out immediately.
    pub async fn run(&self, cancel: watch::Receiver<bool>) {
        if let Err(e) = self.write_once().await {
            warn!(error = %e, "Failed to write initial heartbeat");
        } else {
            info!(node_id = %self.node_id, address = %self.remote_address, "Joined cluster");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.write_once().await {
                        warn!(error = %e, "Failed to write heartbeat");
                    }
                }
                _ = wait_for_cancel(&cancel) => {
                    debug!(node_id = %self.node_id, "Heartbeat writer stopping");
                    break;
                }
            }
        }
    }

    /// Remove this node's heartbeat (graceful departure).
    pub async fn delete_heartbeat(&self) -> Result<()> {
        self.storage.delete(&heartbeat_key(&self.node_id)).await
    }
}

// ---------------------------------------------------------------------------
// Cluster view
// ---------------------------------------------------------------------------

/// The state of a node as judged by its heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Heartbeat within half the dead threshold.
    Alive,
    /// Heartbeat older than half the dead threshold.
    Suspect,
    /// Heartbeat older than the dead threshold.
    Dead,
}

#[derive(Debug, Clone)]
pub struct MemberStatus {
    pub node_id: NodeId,
    pub heartbeat: Heartbeat,
    pub state: NodeState,
}

/// A snapshot of all known nodes.
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub nodes: HashMap<NodeId, MemberStatus>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterView {
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Remote addresses of nodes that count as members. Suspect nodes stay
    /// members so a single late heartbeat does not reshuffle ownership.
    pub fn member_addresses(&self) -> Vec<PeerAddress> {
        let mut addresses: Vec<PeerAddress> = self
            .nodes
            .values()
            .filter(|n| n.state != NodeState::Dead)
            .map(|n| n.heartbeat.remote_address.clone())
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }
}

/// Polls heartbeats and keeps the client manager's topology current.
pub struct ClusterViewBuilder {
    storage: Arc<dyn StorageBackend>,
    poll_interval: Duration,
    dead_threshold: Duration,
    view: Arc<RwLock<ClusterView>>,
}

impl ClusterViewBuilder {
    pub fn new(storage: Arc<dyn StorageBackend>, poll_interval: Duration, dead_threshold: Duration) -> Self {
        Self {
            storage,
            poll_interval,
            dead_threshold,
            view: Arc::new(RwLock::new(ClusterView::empty())),
        }
    }

    pub fn view(&self) -> Arc<RwLock<ClusterView>> {
        Arc::clone(&self.view)
    }

    /// Read every heartbeat file once.
    pub async fn build_once(&self) -> Result<ClusterView> {
        let keys = self.storage.list(HEARTBEAT_PREFIX).await?;
        let now = Utc::now();
        let mut nodes = HashMap::new();

        for key in keys.iter().filter(|k| k.ends_with(".json")) {
            let data = match self.storage.get(key).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read heartbeat");
                    continue;
                }
            };
            let heartbeat = match serde_json::from_slice::<Heartbeat>(&data) {
                Ok(hb) => hb,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to parse heartbeat");
                    continue;
                }
            };
            let age = now
                .signed_duration_since(heartbeat.timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let state = if age > self.dead_threshold {
                NodeState::Dead
            } else if age > self.dead_threshold / 2 {
                NodeState::Suspect
            } else {
                NodeState::Alive
            };
            let node_id = NodeId::new(heartbeat.node_id.clone());
            nodes.insert(
                node_id.clone(),
                MemberStatus {
                    node_id,
                    heartbeat,
                    state,
                },
            );
        }

        Ok(ClusterView {
            nodes,
            updated_at: now,
        })
    }

    /// Poll once and publish the result.
    pub async fn poll_once(&self) -> Result<ClusterView> {
        let view = self.build_once().await?;
        *self.view.write().await = view.clone();
        Ok(view)
    }

    /// Poll until cancelled, refreshing `manager` with the live members.
    pub async fn run(&self, manager: Arc<RemoteClientManager>, cancel: watch::Receiver<bool>) {
        loop {
            match self.poll_once().await {
                Ok(view) => {
                    manager.refresh(view.member_addresses()).await;
                }
                Err(e) => warn!(error = %e, "Failed to poll cluster view"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = wait_for_cancel(&cancel) => {
                    debug!("Cluster view builder stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_storage::local::LocalBackend;

    async fn make_storage(tmp: &tempfile::TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(LocalBackend::new(tmp.path()).await.unwrap())
    }

    fn make_config(node_id: &str, port: u16) -> PipelineConfig {
        let mut config = PipelineConfig::new("memory://");
        config.node_id = NodeId::new(node_id);
        config.remote_address = PeerAddress::new("127.0.0.1", port);
        config
    }

    fn idle_load() -> LoadProbe {
        Arc::new(|| HeartbeatLoad {
            workers: 2,
            queue_depth: 7,
            dropped: 0,
        })
    }

    #[tokio::test]
    async fn test_heartbeat_write_and_read() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = make_storage(&tmp).await;
        let writer = HeartbeatWriter::new(Arc::clone(&storage), &make_config("n1", 11801), idle_load());

        writer.write_once().await.unwrap();
        writer.write_once().await.unwrap();

        let data = storage.get("_cluster/node_n1.json").await.unwrap();
        let hb: Heartbeat = serde_json::from_slice(&data).unwrap();
        assert_eq!(hb.node_id, "n1");
        assert_eq!(hb.version, 2);
        assert_eq!(hb.load.queue_depth, 7);
        assert_eq!(hb.remote_address, PeerAddress::new("127.0.0.1", 11801));

        writer.delete_heartbeat().await.unwrap();
        assert!(!storage.exists("_cluster/node_n1.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_view_classifies_by_age() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = make_storage(&tmp).await;
        HeartbeatWriter::new(Arc::clone(&storage), &make_config("fresh", 11801), idle_load())
            .write_once()
            .await
            .unwrap();

        let stale = |id: &str, port: u16, age_secs: i64| Heartbeat {
            node_id: id.to_string(),
            remote_address: PeerAddress::new("127.0.0.1", port),
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
            version: 1,
            load: HeartbeatLoad::default(),
        };
        for hb in [stale("slow", 11802, 20), stale("gone", 11803, 120)] {
            let key = format!("_cluster/node_{}.json", hb.node_id);
            storage
                .put(&key, serde_json::to_vec(&hb).unwrap().into())
                .await
                .unwrap();
        }

        let builder = ClusterViewBuilder::new(storage, Duration::from_millis(50), Duration::from_secs(30));
        let view = builder.poll_once().await.unwrap();
        assert_eq!(view.count(NodeState::Alive), 1);
        assert_eq!(view.count(NodeState::Suspect), 1);
        assert_eq!(view.count(NodeState::Dead), 1);
        assert_eq!(
            view.member_addresses(),
            vec![PeerAddress::new("127.0.0.1", 11801), PeerAddress::new("127.0.0.1", 11802)]
        );
        assert_eq!(builder.view().read().await.nodes.len(), 3);
    }
}
