//! The graph node that sends each entity to its owner.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{trace, warn};

use meridian_core::error::MeridianError;
use meridian_core::schema::Entity;
use meridian_core::types::GraphId;
use meridian_core::wire::{RemoteData, RemoteMessage};
use meridian_core::Result;

use crate::registry::GraphRegistry;
use crate::remote::manager::RemoteClientManager;
use crate::worker::Inlet;

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub node: String,
    pub local: u64,
    pub remote: u64,
    pub dropped: u64,
}

/// Routes each entity to the owner of its id, under `target`.
///
/// Owned locally, the entity is injected straight into the local graph's
/// entry node. Owned by a peer, it is encoded positionally and handed to
/// that peer's client. A failed hand-off is counted and logged; the record
/// is not retried.
pub struct RemoteDispatcher<E: Entity> {
    name: String,
    target: GraphId,
    manager: Arc<RemoteClientManager>,
    registry: Weak<GraphRegistry>,
    local: AtomicU64,
    remote: AtomicU64,
    dropped: AtomicU64,
    _entity: PhantomData<fn(E)>,
}

impl<E: Entity> RemoteDispatcher<E> {
    pub fn new(
        name: impl Into<String>,
        target: GraphId,
        manager: Arc<RemoteClientManager>,
        registry: &Arc<GraphRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            target,
            manager,
            registry: Arc::downgrade(registry),
            local: AtomicU64::new(0),
            remote: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            _entity: PhantomData,
        })
    }

    pub fn target(&self) -> GraphId {
        self.target
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            node: self.name.clone(),
            local: self.local.load(Ordering::Relaxed),
            remote: self.remote.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    async fn inject_local(&self, item: E) -> Result<()> {
        let registry = self.registry.upgrade().ok_or_else(|| MeridianError::Internal {
            message: "graph registry dropped".to_string(),
        })?;
        let graph = registry.get::<E>(self.target)?.ok_or_else(|| {
            MeridianError::graph(format!("no local graph registered under id {}", self.target))
        })?;
        graph.start(item).await
    }

    fn drop_record(&self, peer: &str, e: &MeridianError) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(node = %self.name, graph_id = %self.target, peer = %peer, error = %e, "Dispatch dropped record");
    }
}

#[async_trait]
impl<E: Entity> Inlet<E> for RemoteDispatcher<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn accept(&self, item: E) -> Result<()> {
        let id = item.id();
        let Some(client) = self.manager.route(&id) else {
            let e = MeridianError::RemoteSend {
                peer: String::new(),
                message: "cluster has no members".to_string(),
            };
            self.drop_record("", &e);
            return Ok(());
        };

        if client.is_local() {
            let outcome = self.inject_local(item).await;
            match outcome {
                Ok(()) => {
                    self.local.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => self.drop_record(&client.address().to_string(), &e),
            }
            return Ok(());
        }

        let message = match RemoteData::encode(&item) {
            Ok(data) => RemoteMessage {
                graph_id: self.target,
                data,
            },
            Err(e) => {
                self.drop_record(&client.address().to_string(), &e);
                return Ok(());
            }
        };
        match client.push(message).await {
            Ok(()) => {
                self.remote.fetch_add(1, Ordering::Relaxed);
                trace!(entity = %id, peer = %client.address(), "Dispatched to owner");
            }
            Err(e) => self.drop_record(&client.address().to_string(), &e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use meridian_core::config::PipelineConfig;
    use meridian_core::telemetry::ServiceCallMetrics;
    use meridian_core::types::PeerAddress;

    use crate::graph::Probe;
    use crate::remote::receiver::RemoteReceiveService;
    use crate::remote::transport::LoopbackTransport;

    fn call(service: &str) -> ServiceCallMetrics {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ServiceCallMetrics::observe(ts, service, 3, 200)
    }

    #[tokio::test]
    async fn test_solo_dispatch_injects_locally() {
        let registry = Arc::new(GraphRegistry::new());
        let receive = Arc::new(RemoteReceiveService::new(Arc::clone(&registry)));
        let config = PipelineConfig::new("memory://");
        let manager = Arc::new(RemoteClientManager::new(
            &config,
            Arc::new(LoopbackTransport::new()),
            receive,
        ));

        let owner = registry.create_if_absent::<ServiceCallMetrics>(GraphId(2)).unwrap();
        let tap = Probe::new("tap");
        owner.add_node(tap.clone()).unwrap();

        let dispatcher = RemoteDispatcher::<ServiceCallMetrics>::new("dispatch", GraphId(2), manager, &registry);
        dispatcher.accept(call("A")).await.unwrap();
        dispatcher.accept(call("B")).await.unwrap();
        assert_eq!(tap.len(), 2);
        assert_eq!(dispatcher.stats().local, 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_counts_drops() {
        let registry = Arc::new(GraphRegistry::new());
        let receive = Arc::new(RemoteReceiveService::new(Arc::clone(&registry)));
        let mut config = PipelineConfig::new("memory://");
        config.remote_address = PeerAddress::new("self", 1);
        let manager = Arc::new(RemoteClientManager::new(
            &config,
            Arc::new(LoopbackTransport::new()),
            receive,
        ));
        // A peer that never registered with the loopback transport.
        manager.refresh([PeerAddress::new("ghost", 2)]).await;
        registry.create_if_absent::<ServiceCallMetrics>(GraphId(2)).unwrap()
            .add_node(Probe::<ServiceCallMetrics>::new("tap"))
            .unwrap();

        let dispatcher = RemoteDispatcher::<ServiceCallMetrics>::new("dispatch", GraphId(2), Arc::clone(&manager), &registry);
        for i in 0..50 {
            dispatcher.accept(call(&format!("svc-{i}"))).await.unwrap();
        }
        manager.close_all().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.local + stats.remote, 50);
        assert!(stats.remote > 0);
        let ghost = manager
            .stats()
            .into_iter()
            .find(|s| s.peer == "ghost:2")
            .unwrap();
        assert_eq!(ghost.out_error, stats.remote);
    }
}
