//! Integration test: Solo-node pipeline.
//!
//! Records injected into the ingest graph are routed locally, merged by id,
//! buffered as dirty rows and written out by the persistence timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use meridian_core::config::PipelineConfig;
use meridian_core::telemetry::{JvmMemoryMetrics, ServiceCallMetrics};
use meridian_core::types::GraphId;
use meridian_runtime::{
    CollectorNode, LoopbackTransport, MetricsPipeline, MetricsPipelineOptions, PersistenceOptions,
    Worker,
};
use meridian_storage::MemoryBackend;

fn call(service: &str, calls: i64, latency_ms: i64) -> ServiceCallMetrics {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    let mut m = ServiceCallMetrics::observe(ts, service, latency_ms, 200);
    m.calls = calls;
    m
}

async fn start_node() -> CollectorNode {
    let mut config = PipelineConfig::new("memory://");
    // Flushing is driven by the test.
    config.persistent_initial_delay = Duration::from_secs(3600);
    CollectorNode::start_with_storage(
        config,
        Arc::new(MemoryBackend::new()),
        Arc::new(LoopbackTransport::new()),
    )
    .await
    .expect("Node should start")
}

async fn wait_processed<E: meridian_core::Entity>(worker: &Worker<E>, count: u64) {
    for _ in 0..200 {
        if worker.stats().processed >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker did not reach {count} processed: {:?}", worker.stats());
}

fn calls_pipeline(node: &CollectorNode, need_merge: bool) -> MetricsPipeline<ServiceCallMetrics> {
    let ctx = node.context();
    ctx.metrics_pipeline(MetricsPipelineOptions {
        name: "service-call".into(),
        ingest: GraphId(100),
        owner: GraphId(101),
        persistence: PersistenceOptions::from_config(ctx.config()).need_merge_db_data(need_merge),
        rollups: Vec::new(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_running_merge_is_persisted() {
    let node = start_node().await;
    let pipeline = calls_pipeline(&node, false);

    for (calls, latency) in [(1, 10), (2, 20), (3, 30)] {
        pipeline.ingest.start(call("checkout", calls, latency)).await.unwrap();
    }
    wait_processed(&pipeline.persistence, 3).await;

    let summary = node.context().timer().flush_all().await;
    assert_eq!(summary.flushed, vec!["service-call-persist"]);
    assert_eq!(summary.report.written, 1);

    let rows = pipeline.dao.scan().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].calls, 6);
    assert_eq!(rows[0].total_latency_ms, 60);
    assert_eq!(rows[0].time_bucket, 202405011230);

    node.shutdown().await;
}

#[tokio::test]
async fn test_later_arrivals_extend_stored_row() {
    for need_merge in [false, true] {
        let node = start_node().await;
        let pipeline = calls_pipeline(&node, need_merge);

        pipeline.ingest.start(call("cart", 2, 5)).await.unwrap();
        wait_processed(&pipeline.persistence, 1).await;
        node.context().timer().flush_all().await;

        pipeline.ingest.start(call("cart", 3, 5)).await.unwrap();
        pipeline.ingest.start(call("cart", 1, 5)).await.unwrap();
        wait_processed(&pipeline.persistence, 3).await;
        node.context().timer().flush_all().await;

        let rows = pipeline.dao.scan().await.unwrap();
        assert_eq!(rows[0].calls, 6, "need_merge_db_data = {need_merge}");
        if !need_merge {
            assert_eq!(pipeline.dao.reads(), 0);
        }
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_shutdown_flushes_pending_rows() {
    let node = start_node().await;
    let pipeline = calls_pipeline(&node, false);

    for service in ["a", "b", "c"] {
        pipeline.ingest.start(call(service, 1, 1)).await.unwrap();
    }
    node.shutdown().await;

    let rows = pipeline.dao.scan().await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(pipeline.ingest.start(call("late", 1, 1)).await.is_ok());
    assert_eq!(pipeline.dispatcher.stats().dropped, 1);
}

#[tokio::test]
async fn test_graphs_for_different_types_run_side_by_side() {
    let node = start_node().await;
    let calls = calls_pipeline(&node, false);
    let jvm: MetricsPipeline<JvmMemoryMetrics> = node
        .context()
        .metrics_pipeline(MetricsPipelineOptions {
            name: "jvm".into(),
            ingest: GraphId(200),
            owner: GraphId(201),
            persistence: PersistenceOptions::default(),
            rollups: Vec::new(),
        })
        .unwrap();

    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    jvm.ingest.start(JvmMemoryMetrics::sample(ts, "pod-1", 100, 512, 1)).await.unwrap();
    jvm.ingest.start(JvmMemoryMetrics::sample(ts, "pod-1", 140, 512, 2)).await.unwrap();
    calls.ingest.start(call("x", 1, 1)).await.unwrap();
    node.shutdown().await;

    let rows = jvm.dao.scan().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].heap_used, 140);
    assert_eq!(rows[0].gc_count, 3);
    assert_eq!(calls.dao.scan().await.unwrap().len(), 1);
    assert_eq!(node.context().registry().len(), 4);
}
