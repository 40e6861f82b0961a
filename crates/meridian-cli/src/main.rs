//! Meridian CLI: runs a solo collector node fed with synthetic telemetry.
//!
//! ```text
//! meridian [config.json]
//! ```
//!
//! Without a config file the node stores into `memory://`. Calls for a
//! handful of services are generated for a few seconds, flushed, and the
//! stored aggregates plus the pipeline counters are printed as JSON.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meridian_core::config::PipelineConfig;
use meridian_core::telemetry::ServiceCallMetrics;
use meridian_core::types::{Downsampling, GraphId};
use meridian_core::Result;
use meridian_runtime::{CollectorNode, LoopbackTransport, MetricsPipelineOptions, PersistenceOptions};

const SERVICES: [&str; 4] = ["checkout", "cart", "catalog", "payments"];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Meridian v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => {
            let mut config = PipelineConfig::new("memory://");
            config.persistent_initial_delay = Duration::from_secs(1);
            config.persistent_period = Duration::from_secs(2);
            config
        }
    };

    let transport = Arc::new(LoopbackTransport::new());
    let node = CollectorNode::start(config, transport.clone()).await?;
    transport.register(node.config.remote_address.clone(), node.context().receive_service());

    let ctx = node.context();
    let pipeline = ctx.metrics_pipeline::<ServiceCallMetrics>(MetricsPipelineOptions {
        name: "service-call".into(),
        ingest: GraphId(1),
        owner: GraphId(2),
        persistence: PersistenceOptions::from_config(ctx.config()).need_merge_db_data(true),
        rollups: vec![Downsampling::Hour],
    })?;

    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    for n in 0..250u32 {
        ticker.tick().await;
        let service = SERVICES[n as usize % SERVICES.len()];
        let status = if n % 17 == 0 { 503 } else { 200 };
        let latency_ms = 5 + i64::from(n % 40);
        pipeline
            .ingest
            .start(ServiceCallMetrics::observe(Utc::now(), service, latency_ms, status))
            .await?;
    }

    node.shutdown().await;

    let mut rows = pipeline.dao.scan().await?;
    for rollup in &pipeline.rollups {
        rows.extend(rollup.dao.scan().await?);
    }
    for row in rows {
        println!(
            "{:>12} bucket={} calls={} errors={} avg_latency_ms={:.1}",
            row.service,
            row.time_bucket,
            row.calls,
            row.errors,
            row.avg_latency_ms()
        );
    }
    let stats = serde_json::to_string_pretty(&ctx.stats())?;
    println!("{stats}");
    info!("Demo finished");
    Ok(())
}
