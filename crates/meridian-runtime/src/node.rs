//! The collector node: one process of the pipeline cluster.
//!
//! [`CollectorNode`] opens the storage backend named by
//! `config.storage_uri`, builds the [`PipelineContext`] and runs the
//! background loops: the persistence timer and, unless static peers are
//! configured, the heartbeat writer and cluster view refresher.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use meridian_core::config::PipelineConfig;
use meridian_core::error::MeridianError;
use meridian_core::storage::StorageBackend;
use meridian_core::transport::RemoteTransport;
use meridian_core::Result;
use meridian_storage::local::LocalBackend;
use meridian_storage::memory::MemoryBackend;

use crate::context::PipelineContext;
use crate::membership::{ClusterViewBuilder, HeartbeatWriter, LoadProbe};
use crate::remote::transport::RemoteServer;

/// A running collector node.
pub struct CollectorNode {
    /// Node configuration.
    pub config: PipelineConfig,

    /// The shared storage backend.
    pub storage: Arc<dyn StorageBackend>,

    context: Arc<PipelineContext>,
    heartbeat: Option<Arc<HeartbeatWriter>>,
    cancel_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CollectorNode {
    /// Start a node, opening storage from `config.storage_uri`.
    pub async fn start(config: PipelineConfig, transport: Arc<dyn RemoteTransport>) -> Result<Self> {
        let storage = open_storage(&config.storage_uri).await?;
        Self::start_with_storage(config, storage, transport).await
    }

    /// Start a node on an already opened backend. Nodes sharing one backend
    /// discover each other through their heartbeats.
    pub async fn start_with_storage(
        config: PipelineConfig,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(PipelineContext::new(
            config.clone(),
            Arc::clone(&storage),
            transport,
        ));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let timer = context.timer();
        let timer_cancel = cancel_rx.clone();
        tasks.push(tokio::spawn(async move { timer.run(timer_cancel).await }));

        let heartbeat = if config.static_peers.is_empty() {
            let load_ctx = Arc::clone(&context);
            let load: LoadProbe = Arc::new(move || load_ctx.load());
            let writer = Arc::new(HeartbeatWriter::new(Arc::clone(&storage), &config, load));
            let view = Arc::new(ClusterViewBuilder::new(
                Arc::clone(&storage),
                config.heartbeat_interval,
                config.dead_threshold,
            ));

            let hb = Arc::clone(&writer);
            let hb_cancel = cancel_rx.clone();
            tasks.push(tokio::spawn(async move { hb.run(hb_cancel).await }));

            let manager = context.remote();
            tasks.push(tokio::spawn(async move { view.run(manager, cancel_rx).await }));
            Some(writer)
        } else {
            context.remote().refresh(config.static_peers.clone()).await;
            None
        };

        info!(
            node_id = %config.node_id,
            remote_address = %config.remote_address,
            storage_uri = %config.storage_uri,
            members = context.remote().cluster_size(),
            "Collector node started"
        );

        Ok(Self {
            config,
            storage,
            context,
            heartbeat,
            cancel_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// Listen for peer traffic on `config.remote_address`.
    pub async fn serve_tcp(&self) -> Result<SocketAddr> {
        let server = RemoteServer::bind(
            &self.config.remote_address.to_string(),
            self.context.receive_service(),
        )
        .await?;
        let addr = server.local_addr()?;
        let cancel = self.cancel_tx.subscribe();
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tokio::spawn(server.run(cancel)));
        Ok(addr)
    }

    /// Stop background loops, drain and flush every graph, close remote
    /// clients and leave the cluster.
    pub async fn shutdown(&self) {
        info!(node_id = %self.config.node_id, "Collector node shutting down");
        let _ = self.cancel_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        self.context.registry().stop_all().await;
        self.context.remote().close_all().await;

        if let Some(writer) = &self.heartbeat {
            if let Err(e) = writer.delete_heartbeat().await {
                warn!(error = %e, "Failed to remove heartbeat");
            }
        }
        info!(node_id = %self.config.node_id, "Collector node stopped");
    }
}

/// Open the backend named by a storage URI: `memory://`, `local://<path>`
/// or a raw path. A leading `~/` expands to the home directory.
pub async fn open_storage(uri: &str) -> Result<Arc<dyn StorageBackend>> {
    if uri == "memory://" {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    let path = uri.strip_prefix("local://").unwrap_or(uri);
    let expanded = match path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        Some(rest) => {
            let home = home_dir().ok_or_else(|| MeridianError::Config {
                message: "Cannot determine home directory".to_string(),
            })?;
            home.join(rest)
        }
        None => std::path::PathBuf::from(path),
    };
    Ok(Arc::new(LocalBackend::new(expanded).await?))
}

/// Best-effort home directory detection.
fn home_dir() -> Option<std::path::PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(std::path::PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(std::path::PathBuf::from)
    }
}
