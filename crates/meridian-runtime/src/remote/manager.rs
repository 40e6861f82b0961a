//! Cluster member clients and ownership routing.
//!
//! [`RemoteClientManager`] keeps one [`RemoteClient`] per cluster member,
//! sorted by address alongside the [`ClusterTopology`] so that a route
//! lookup is a hash plus an index. Membership updates arrive through
//! [`refresh`](RemoteClientManager::refresh): unchanged members keep their
//! client (and its buffer), new members get a fresh one, departed members'
//! clients are closed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use meridian_core::config::{PipelineConfig, RoutingStrategy};
use meridian_core::transport::RemoteTransport;
use meridian_core::types::{EntityId, PeerAddress};

use crate::remote::client::{
    RemoteClient, RemoteClientStats, SelfClient, StreamingClient, StreamingSettings,
};
use crate::remote::receiver::RemoteReceiveService;
use crate::remote::topology::ClusterTopology;

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyChange {
    pub added: Vec<PeerAddress>,
    pub removed: Vec<PeerAddress>,
    pub unchanged: usize,
}

impl TopologyChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct Routing {
    topology: ClusterTopology,
    clients: Vec<Arc<dyn RemoteClient>>,
}

/// Owns the per-member clients and answers "who owns this id".
pub struct RemoteClientManager {
    self_address: PeerAddress,
    transport: Arc<dyn RemoteTransport>,
    receive: Arc<RemoteReceiveService>,
    strategy: RoutingStrategy,
    settings: StreamingSettings,
    routing: RwLock<Routing>,
}

impl RemoteClientManager {
    /// A manager whose cluster initially holds only this node.
    pub fn new(
        config: &PipelineConfig,
        transport: Arc<dyn RemoteTransport>,
        receive: Arc<RemoteReceiveService>,
    ) -> Self {
        let self_address = config.remote_address.clone();
        let local: Arc<dyn RemoteClient> =
            Arc::new(SelfClient::new(self_address.clone(), Arc::clone(&receive)));
        Self {
            self_address: self_address.clone(),
            transport,
            receive,
            strategy: config.routing,
            settings: StreamingSettings {
                buffer_size: config.remote_buffer_size,
                batch_size: config.remote_batch_size,
                timeout: config.remote_timeout,
            },
            routing: RwLock::new(Routing {
                topology: ClusterTopology::new([self_address], config.routing),
                clients: vec![local],
            }),
        }
    }

    pub fn self_address(&self) -> &PeerAddress {
        &self.self_address
    }

    /// Replace the member set. This node is always a member.
    pub async fn refresh(&self, members: impl IntoIterator<Item = PeerAddress>) -> TopologyChange {
        let topology = ClusterTopology::new(
            members.into_iter().chain([self.self_address.clone()]),
            self.strategy,
        );

        let (change, retired) = {
            let mut routing = self.routing.write().unwrap_or_else(|p| p.into_inner());
            if routing.topology == topology {
                return TopologyChange {
                    unchanged: topology.len(),
                    ..TopologyChange::default()
                };
            }

            let mut existing: HashMap<PeerAddress, Arc<dyn RemoteClient>> = routing
                .clients
                .iter()
                .map(|c| (c.address().clone(), Arc::clone(c)))
                .collect();
            let mut change = TopologyChange::default();
            let mut clients = Vec::with_capacity(topology.len());
            for member in topology.members() {
                match existing.remove(member) {
                    Some(client) => {
                        change.unchanged += 1;
                        clients.push(client);
                    }
                    None => {
                        change.added.push(member.clone());
                        clients.push(self.connect(member));
                    }
                }
            }
            let retired: Vec<Arc<dyn RemoteClient>> = existing.into_values().collect();
            change.removed = retired.iter().map(|c| c.address().clone()).collect();
            change.removed.sort();

            *routing = Routing { topology, clients };
            (change, retired)
        };

        for client in retired {
            client.close().await;
        }
        info!(
            added = change.added.len(),
            removed = change.removed.len(),
            members = change.unchanged + change.added.len(),
            "Cluster topology changed"
        );
        change
    }

    fn connect(&self, member: &PeerAddress) -> Arc<dyn RemoteClient> {
        if *member == self.self_address {
            Arc::new(SelfClient::new(member.clone(), Arc::clone(&self.receive)))
        } else {
            debug!(peer = %member, "Opening remote client");
            Arc::new(StreamingClient::new(
                member.clone(),
                Arc::clone(&self.transport),
                self.settings,
            ))
        }
    }

    /// The client of the member owning `id`.
    pub fn route(&self, id: &EntityId) -> Option<Arc<dyn RemoteClient>> {
        let routing = self.routing.read().unwrap_or_else(|p| p.into_inner());
        routing
            .topology
            .owner_index(id)
            .and_then(|i| routing.clients.get(i))
            .cloned()
    }

    pub fn members(&self) -> Vec<PeerAddress> {
        self.routing
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .topology
            .members()
            .to_vec()
    }

    pub fn cluster_size(&self) -> usize {
        self.routing
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .topology
            .len()
    }

    pub fn stats(&self) -> Vec<RemoteClientStats> {
        self.clients().iter().map(|c| c.stats()).collect()
    }

    /// Close every client. Used on shutdown.
    pub async fn close_all(&self) {
        for client in self.clients() {
            client.close().await;
        }
    }

    fn clients(&self) -> Vec<Arc<dyn RemoteClient>> {
        self.routing
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clients
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GraphRegistry;
    use crate::remote::transport::LoopbackTransport;

    fn manager() -> RemoteClientManager {
        let mut config = PipelineConfig::new("memory://");
        config.remote_address = PeerAddress::new("node-a", 11800);
        let receive = Arc::new(RemoteReceiveService::new(Arc::new(GraphRegistry::new())));
        RemoteClientManager::new(&config, Arc::new(LoopbackTransport::new()), receive)
    }

    #[tokio::test]
    async fn test_solo_routes_everything_locally() {
        let manager = manager();
        assert_eq!(manager.cluster_size(), 1);
        let client = manager.route(&EntityId::new("any")).unwrap();
        assert!(client.is_local());
    }

    #[tokio::test]
    async fn test_refresh_keeps_adds_and_removes() {
        let manager = manager();
        let b = PeerAddress::new("node-b", 11800);
        let c = PeerAddress::new("node-c", 11800);

        let change = manager.refresh([b.clone(), c.clone()]).await;
        assert_eq!(change.added, vec![b.clone(), c.clone()]);
        assert_eq!(change.unchanged, 1);
        assert_eq!(manager.cluster_size(), 3);

        let again = manager.refresh([c.clone(), b.clone()]).await;
        assert!(again.is_empty());

        let change = manager.refresh([c.clone()]).await;
        assert_eq!(change.removed, vec![b]);
        assert_eq!(manager.members().len(), 2);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_route_is_stable_for_fixed_topology() {
        let manager = manager();
        manager
            .refresh((1..5).map(|i| PeerAddress::new(format!("node-{i}"), 11800)))
            .await;
        for i in 0..100 {
            let id = EntityId::compose(202405011200, format!("svc-{i}"));
            let first = manager.route(&id).unwrap().address().clone();
            let second = manager.route(&id).unwrap().address().clone();
            assert_eq!(first, second);
        }
        manager.close_all().await;
    }
}
