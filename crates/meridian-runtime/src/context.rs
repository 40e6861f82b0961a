//! Shared pipeline services and worker factories.
//!
//! A [`PipelineContext`] holds what every graph on a node shares: the
//! configuration, the storage backend, the graph registry, the persistence
//! timer and the remote client manager. Its factories build workers that are
//! already started, counted in [`PipelineContext::stats`] and, for
//! persistence workers, registered with the timer.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use meridian_core::config::PipelineConfig;
use meridian_core::dao::{BatchWriter, MetricsDao};
use meridian_core::schema::Entity;
use meridian_core::storage::StorageBackend;
use meridian_core::transport::RemoteTransport;
use meridian_core::types::{Downsampling, GraphId};
use meridian_core::Result;
use meridian_storage::kv_dao::KvMetricsDao;

use crate::aggregation::AggregationProcessor;
use crate::graph::{Bridge, Graph};
use crate::membership::HeartbeatLoad;
use crate::persistence::{Convergence, PersistenceOptions, PersistenceProcessor, Retention};
use crate::registry::GraphRegistry;
use crate::remote::client::RemoteClientStats;
use crate::remote::dispatcher::RemoteDispatcher;
use crate::remote::manager::RemoteClientManager;
use crate::remote::receiver::{ReceiveStats, RemoteReceiveService};
use crate::timer::{PersistenceTimer, TimerSettings, TimerStats};
use crate::worker::{StatsSource, Worker, WorkerSettings, WorkerStatsSnapshot};

/// Everything counted on one node.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub workers: Vec<WorkerStatsSnapshot>,
    pub remote: Vec<RemoteClientStats>,
    pub receive: ReceiveStats,
    pub timer: TimerStats,
}

/// The standard metrics pipeline of one entity type.
#[derive(Debug, Clone)]
pub struct MetricsPipelineOptions {
    /// Prefix of every node name.
    pub name: String,
    /// Graph that decoded records are injected into on any node.
    pub ingest: GraphId,
    /// Graph that runs on the owner of each id.
    pub owner: GraphId,
    pub persistence: PersistenceOptions,
    /// Coarser granularities persisted behind the minute worker.
    pub rollups: Vec<Downsampling>,
}

/// One coarser-granularity persistence stage of a pipeline.
pub struct Rollup<E: Entity> {
    pub granularity: Downsampling,
    pub persistence: Arc<Worker<E>>,
    pub dao: Arc<KvMetricsDao<E>>,
}

/// Handles on a built metrics pipeline.
pub struct MetricsPipeline<E: Entity> {
    pub ingest: Graph<E>,
    pub owner: Graph<E>,
    pub dispatcher: Arc<RemoteDispatcher<E>>,
    pub aggregation: Arc<Worker<E>>,
    pub persistence: Arc<Worker<E>>,
    pub dao: Arc<KvMetricsDao<E>>,
    pub rollups: Vec<Rollup<E>>,
}

/// Services shared by all graphs of a node.
pub struct PipelineContext {
    config: PipelineConfig,
    storage: Arc<dyn StorageBackend>,
    registry: Arc<GraphRegistry>,
    timer: Arc<PersistenceTimer>,
    receive: Arc<RemoteReceiveService>,
    remote: Arc<RemoteClientManager>,
    workers: RwLock<Vec<Arc<dyn StatsSource>>>,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        let registry = Arc::new(GraphRegistry::new());
        let receive = Arc::new(RemoteReceiveService::new(Arc::clone(&registry)));
        let remote = Arc::new(RemoteClientManager::new(
            &config,
            transport,
            Arc::clone(&receive),
        ));
        let timer = Arc::new(PersistenceTimer::new(TimerSettings::from_config(&config)));
        Self {
            config,
            storage,
            registry,
            timer,
            receive,
            remote,
            workers: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.storage)
    }

    pub fn registry(&self) -> Arc<GraphRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn timer(&self) -> Arc<PersistenceTimer> {
        Arc::clone(&self.timer)
    }

    pub fn receive_service(&self) -> Arc<RemoteReceiveService> {
        Arc::clone(&self.receive)
    }

    pub fn remote(&self) -> Arc<RemoteClientManager> {
        Arc::clone(&self.remote)
    }

    /// The graph under `id`, created empty if absent.
    pub fn graph<E: Entity>(&self, id: GraphId) -> Result<Graph<E>> {
        self.registry.create_if_absent::<E>(id)
    }

    fn track(&self, worker: Arc<dyn StatsSource>) {
        self.workers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(worker);
    }

    /// A started aggregation worker.
    pub fn aggregation_worker<E: Entity>(&self, name: impl Into<String>) -> Arc<Worker<E>> {
        self.spawn_aggregation(name, AggregationProcessor::new(self.config.aggregation_idle_ttl))
    }

    /// A started aggregation worker that projects each record first.
    pub fn aggregation_worker_with<E: Entity>(
        &self,
        name: impl Into<String>,
        transform: impl Fn(E) -> E + Send + Sync + 'static,
    ) -> Arc<Worker<E>> {
        let processor =
            AggregationProcessor::new(self.config.aggregation_idle_ttl).with_transform(transform);
        self.spawn_aggregation(name, processor)
    }

    fn spawn_aggregation<E: Entity>(
        &self,
        name: impl Into<String>,
        processor: AggregationProcessor<E>,
    ) -> Arc<Worker<E>> {
        let worker = Worker::spawn(name, WorkerSettings::from_config(&self.config), processor);
        self.track(worker.clone());
        worker
    }

    /// A started persistence worker, registered with the timer.
    pub fn persistence_worker<E: Entity>(
        &self,
        name: impl Into<String>,
        dao: Arc<dyn MetricsDao<E>>,
        writer: Arc<dyn BatchWriter>,
        options: PersistenceOptions,
    ) -> Arc<Worker<E>> {
        let name = name.into();
        let processor = PersistenceProcessor::new(name.clone(), dao, writer, options);
        let worker = Worker::spawn(name, WorkerSettings::from_config(&self.config), processor);
        self.timer.register(worker.clone());
        self.track(worker.clone());
        worker
    }

    /// A persistence worker writing to this node's storage backend.
    pub fn kv_persistence_worker<E: Entity>(
        &self,
        name: impl Into<String>,
        options: PersistenceOptions,
    ) -> (Arc<Worker<E>>, Arc<KvMetricsDao<E>>) {
        let dao = Arc::new(KvMetricsDao::<E>::new(self.storage()));
        let worker = self.persistence_worker(name, dao.clone(), dao.clone(), options);
        (worker, dao)
    }

    /// A node routing each entity to the owner's graph `target`.
    pub fn remote_dispatcher<E: Entity>(
        &self,
        name: impl Into<String>,
        target: GraphId,
    ) -> Arc<RemoteDispatcher<E>> {
        RemoteDispatcher::new(name, target, self.remote(), &self.registry)
    }

    /// Build ingest → dispatch → owner aggregation → persistence, with one
    /// roll-up persistence worker per entry of `rollups`.
    ///
    /// The ingest graph only routes. The owner graph merges by id and
    /// persists, so each id is aggregated on exactly one node. The ingest
    /// graph is registered first so a registry-wide stop drains upstream
    /// before downstream.
    ///
    /// Roll-ups receive the increments the minute worker flushed, re-keyed
    /// with [`Entity::rebucket`], and merge them into their own table. Models
    /// that do not rebucket write no roll-up rows.
    pub fn metrics_pipeline<E: Entity>(&self, options: MetricsPipelineOptions) -> Result<MetricsPipeline<E>> {
        let ingest = self.graph::<E>(options.ingest)?;
        let dispatcher = self.remote_dispatcher::<E>(format!("{}-dispatch", options.name), options.owner);
        ingest.add_node(dispatcher.clone())?;

        let owner = self.graph::<E>(options.owner)?;
        let aggregation = self.aggregation_worker::<E>(format!("{}-aggregate", options.name));
        let (persistence, dao) =
            self.kv_persistence_worker::<E>(format!("{}-persist", options.name), options.persistence);
        let persist_node = owner
            .add_node(aggregation.clone())?
            .add_next(persistence.clone())?;

        let rollup_options = PersistenceOptions {
            need_merge_db_data: true,
            convergence: Convergence::Merge,
            retention: Retention::Remove,
            ..options.persistence
        };
        let mut rollups = Vec::with_capacity(options.rollups.len());
        for granularity in options.rollups {
            let rollup_dao = Arc::new(KvMetricsDao::<E>::for_downsampling(self.storage(), granularity));
            let worker = self.persistence_worker(
                format!("{}-persist-{}", options.name, granularity.name()),
                rollup_dao.clone(),
                rollup_dao.clone(),
                rollup_options,
            );
            let bridge = Bridge::new(
                format!("{}-to-{}", options.name, granularity.name()),
                worker.clone(),
                move |increment: E| increment.rebucket(granularity),
            );
            persist_node.add_next(bridge)?;
            owner.add_node(worker.clone())?;
            rollups.push(Rollup {
                granularity,
                persistence: worker,
                dao: rollup_dao,
            });
        }

        Ok(MetricsPipeline {
            ingest,
            owner,
            dispatcher,
            aggregation,
            persistence,
            dao,
            rollups,
        })
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            workers: self.worker_stats(),
            remote: self.remote.stats(),
            receive: self.receive.stats(),
            timer: self.timer.stats(),
        }
    }

    pub fn worker_stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|w| w.stats())
            .collect()
    }

    /// Load figures for the heartbeat.
    pub fn load(&self) -> HeartbeatLoad {
        let workers = self.worker_stats();
        HeartbeatLoad {
            workers: workers.len(),
            queue_depth: workers.iter().map(|w| w.queue_depth).sum(),
            dropped: workers.iter().map(|w| w.dropped).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use meridian_core::telemetry::ServiceCallMetrics;
    use meridian_storage::memory::MemoryBackend;

    use crate::remote::transport::LoopbackTransport;

    fn context() -> PipelineContext {
        PipelineContext::new(
            PipelineConfig::new("memory://"),
            Arc::new(MemoryBackend::new()),
            Arc::new(LoopbackTransport::new()),
        )
    }

    #[tokio::test]
    async fn test_metrics_pipeline_wiring() {
        let ctx = context();
        let pipeline = ctx
            .metrics_pipeline::<ServiceCallMetrics>(MetricsPipelineOptions {
                name: "calls".into(),
                ingest: GraphId(10),
                owner: GraphId(11),
                persistence: PersistenceOptions::from_config(ctx.config()),
                rollups: Vec::new(),
            })
            .unwrap();

        assert_eq!(pipeline.owner.node_names(), vec!["calls-aggregate", "calls-persist"]);
        assert_eq!(pipeline.ingest.node_names(), vec!["calls-dispatch"]);
        assert_eq!(ctx.timer().registered(), vec!["calls-persist"]);
        assert_eq!(ctx.registry().ids(), vec![GraphId(10), GraphId(11)]);

        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        for _ in 0..3 {
            pipeline
                .ingest
                .start(ServiceCallMetrics::observe(ts, "A", 4, 200))
                .await
                .unwrap();
        }
        ctx.registry().stop_all().await;

        let rows = pipeline.dao.scan().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].calls, 3);
        assert_eq!(rows[0].total_latency_ms, 12);
        assert_eq!(ctx.stats().workers.len(), 2);
        assert_eq!(pipeline.dispatcher.stats().local, 3);
    }

    async fn wait_processed(worker: &Worker<ServiceCallMetrics>, count: u64) {
        for _ in 0..500 {
            if worker.stats().processed >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("{} processed {:?}", worker.stats().worker, worker.stats());
    }

    #[tokio::test]
    async fn test_rollups_receive_increments() {
        let ctx = context();
        let pipeline = ctx
            .metrics_pipeline::<ServiceCallMetrics>(MetricsPipelineOptions {
                name: "calls".into(),
                ingest: GraphId(20),
                owner: GraphId(21),
                persistence: PersistenceOptions::from_config(ctx.config()),
                rollups: vec![Downsampling::Hour, Downsampling::Day],
            })
            .unwrap();
        assert_eq!(
            pipeline.owner.node_names(),
            vec![
                "calls-aggregate",
                "calls-persist",
                "calls-to-hour",
                "calls-persist-hour",
                "calls-to-day",
                "calls-persist-day",
            ]
        );
        assert_eq!(
            ctx.timer().registered(),
            vec!["calls-persist", "calls-persist-hour", "calls-persist-day"]
        );

        let minute = |m| Utc.with_ymd_and_hms(2024, 5, 1, 12, m, 0).unwrap();
        for _ in 0..3 {
            pipeline.ingest.start(ServiceCallMetrics::observe(minute(0), "A", 4, 200)).await.unwrap();
        }
        wait_processed(&pipeline.persistence, 3).await;
        ctx.timer().flush_all().await;

        for m in [0, 0, 1] {
            pipeline.ingest.start(ServiceCallMetrics::observe(minute(m), "A", 4, 200)).await.unwrap();
        }
        wait_processed(&pipeline.persistence, 6).await;
        ctx.timer().flush_all().await;
        ctx.registry().stop_all().await;

        let minutes: Vec<i64> = pipeline.dao.scan().await.unwrap().iter().map(|r| r.calls).collect();
        assert_eq!(minutes, vec![5, 1]);
        for rollup in &pipeline.rollups {
            let rows = rollup.dao.scan().await.unwrap();
            assert_eq!(rows.len(), 1, "{:?}", rollup.granularity);
            assert_eq!(rows[0].calls, 6, "{:?}", rollup.granularity);
            assert_eq!(rows[0].total_latency_ms, 24);
        }
        assert_eq!(pipeline.rollups[0].dao.scan().await.unwrap()[0].time_bucket, 2024050112);
        assert_eq!(pipeline.rollups[1].dao.scan().await.unwrap()[0].time_bucket, 20240501);
    }
}
