//! Meridian runtime: the streaming aggregation pipeline.
//!
//! Records enter a per-type [`Graph`] and flow through queue-isolated
//! [`Worker`]s: a [`RemoteDispatcher`] routes every entity to the node that
//! owns its id, an aggregation worker merges same-id entities in memory, and
//! a persistence worker buffers the merged rows until the
//! [`PersistenceTimer`] flushes them to storage. [`CollectorNode`] ties the
//! pieces to a storage backend and the cluster membership loops.

pub mod aggregation;
pub mod context;
pub mod graph;
pub mod membership;
pub mod node;
pub mod persistence;
pub mod registry;
pub mod remote;
pub mod timer;
pub mod worker;

pub use aggregation::AggregationProcessor;
pub use context::{MetricsPipeline, MetricsPipelineOptions, PipelineContext, PipelineStats, Rollup};
pub use graph::{Bridge, Graph, Node, Probe};
pub use membership::{
    ClusterView, ClusterViewBuilder, Heartbeat, HeartbeatLoad, HeartbeatWriter, MemberStatus,
    NodeState,
};
pub use node::CollectorNode;
pub use persistence::{Convergence, PersistenceOptions, PersistenceProcessor, Retention};
pub use registry::{ErasedGraph, GraphRegistry};
pub use remote::{
    ClusterTopology, LoopbackTransport, RemoteClientManager, RemoteDispatcher,
    RemoteReceiveService, RemoteServer, TcpTransport,
};
pub use timer::{Flushable, FlushSummary, PersistenceTimer, TimerSettings};
pub use worker::{
    Downstream, FlushReport, Inlet, Processor, StatsSource, Worker, WorkerSettings,
    WorkerStatsSnapshot,
};

/// Wait until the watch channel signals `true` (cancellation).
pub(crate) async fn wait_for_cancel(rx: &tokio::sync::watch::Receiver<bool>) {
    let mut rx = rx.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped; treat as cancel.
            return;
        }
    }
}
