//! The process-wide graph registry.
//!
//! Graphs are keyed by [`GraphId`] and typed by their entity. The registry
//! keeps each graph twice: once as the typed [`Graph`] for local callers and
//! once behind [`ErasedGraph`] so the remote receiver can inject a positional
//! [`RemoteData`] without knowing the entity type at compile time.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use meridian_core::error::MeridianError;
use meridian_core::schema::Entity;
use meridian_core::types::GraphId;
use meridian_core::wire::RemoteData;
use meridian_core::Result;

use crate::graph::Graph;

/// A graph seen without its entity type.
#[async_trait]
pub trait ErasedGraph: Send + Sync {
    fn graph_id(&self) -> GraphId;

    /// Name of the entity type the graph processes.
    fn type_name(&self) -> &'static str;

    /// Decode `data` as the graph's entity and inject it.
    async fn inject(&self, data: RemoteData) -> Result<()>;

    /// Stop every node of the graph.
    async fn stop(&self);
}

#[async_trait]
impl<E: Entity> ErasedGraph for Graph<E> {
    fn graph_id(&self) -> GraphId {
        self.id()
    }

    fn type_name(&self) -> &'static str {
        type_name::<E>()
    }

    async fn inject(&self, data: RemoteData) -> Result<()> {
        let entity = data.decode::<E>()?;
        self.start(entity).await
    }

    async fn stop(&self) {
        Graph::stop(self).await
    }
}

struct Registered {
    type_name: &'static str,
    typed: Box<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedGraph>,
}

#[derive(Default)]
struct RegistryInner {
    graphs: HashMap<GraphId, Registered>,
    order: Vec<GraphId>,
}

/// All graphs of one process.
#[derive(Default)]
pub struct GraphRegistry {
    inner: RwLock<RegistryInner>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the graph registered under `id`, creating an empty one if none
    /// exists. Fails if `id` is already taken by another entity type.
    pub fn create_if_absent<E: Entity>(&self, id: GraphId) -> Result<Graph<E>> {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = inner.graphs.get(&id) {
            return downcast::<E>(id, existing);
        }

        let graph = Graph::<E>::new(id);
        inner.graphs.insert(
            id,
            Registered {
                type_name: type_name::<E>(),
                typed: Box::new(graph.clone()),
                erased: Arc::new(graph.clone()),
            },
        );
        inner.order.push(id);
        info!(graph_id = %id, entity = type_name::<E>(), "Graph created");
        Ok(graph)
    }

    /// The typed graph under `id`, if one is registered.
    pub fn get<E: Entity>(&self, id: GraphId) -> Result<Option<Graph<E>>> {
        let inner = self.read();
        inner
            .graphs
            .get(&id)
            .map(|registered| downcast::<E>(id, registered))
            .transpose()
    }

    /// The type-erased graph under `id`, used by the remote receiver.
    pub fn erased(&self, id: GraphId) -> Option<Arc<dyn ErasedGraph>> {
        self.read().graphs.get(&id).map(|r| Arc::clone(&r.erased))
    }

    /// Registered ids in creation order.
    pub fn ids(&self) -> Vec<GraphId> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every graph in creation order.
    pub async fn stop_all(&self) {
        let graphs: Vec<Arc<dyn ErasedGraph>> = {
            let inner = self.read();
            inner
                .order
                .iter()
                .filter_map(|id| inner.graphs.get(id))
                .map(|r| Arc::clone(&r.erased))
                .collect()
        };
        for graph in graphs {
            debug!(graph_id = %graph.graph_id(), "Stopping graph");
            graph.stop().await;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }
}

fn downcast<E: Entity>(id: GraphId, registered: &Registered) -> Result<Graph<E>> {
    registered
        .typed
        .downcast_ref::<Graph<E>>()
        .cloned()
        .ok_or(MeridianError::GraphTypeMismatch {
            graph_id: id,
            expected: type_name::<E>(),
            found: registered.type_name,
        })
}
