//! Per-entity-type processing graphs.
//!
//! A [`Graph`] is a DAG of [`Inlet`]s for one entity type. The first node
//! added is the entry node that [`Graph::start`] injects into; every
//! [`Node::add_next`] call adds a fan-out edge:
//!
//! ```ignore
//! let graph = registry.create_if_absent::<ServiceCallMetrics>(GraphId(300))?;
//! graph.add_node(aggregate)?.add_next(persist)?;
//! graph.start(record).await?;
//! ```
//!
//! [`Graph::find_node`] looks up a node by name so independently built
//! graphs can be composed with a [`Bridge`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use meridian_core::error::MeridianError;
use meridian_core::schema::Entity;
use meridian_core::types::GraphId;
use meridian_core::Result;

use crate::worker::Inlet;

struct GraphInner<E: Entity> {
    id: GraphId,
    order: Vec<String>,
    nodes: HashMap<String, Arc<dyn Inlet<E>>>,
}

/// A DAG of nodes processing one entity type. Cheap to clone.
pub struct Graph<E: Entity> {
    inner: Arc<RwLock<GraphInner<E>>>,
}

impl<E: Entity> Clone for Graph<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> Graph<E> {
    /// An empty graph.
    pub fn new(id: GraphId) -> Self {
        Self {
            inner: Arc::new(RwLock::new(GraphInner {
                id,
                order: Vec::new(),
                nodes: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> GraphId {
        self.read().id
    }

    /// Add a node. The first node added becomes the entry node.
    pub fn add_node(&self, node: Arc<dyn Inlet<E>>) -> Result<Node<E>> {
        self.insert(&node)?;
        Ok(Node {
            graph: self.clone(),
            inlet: node,
        })
    }

    /// Look up a node by name.
    pub fn find_node(&self, name: &str) -> Result<Node<E>> {
        let inner = self.read();
        let inlet = inner.nodes.get(name).cloned().ok_or_else(|| {
            MeridianError::graph(format!("graph {} has no node '{name}'", inner.id))
        })?;
        Ok(Node {
            graph: self.clone(),
            inlet,
        })
    }

    /// The entry node, if any node was added.
    pub fn entry(&self) -> Option<Arc<dyn Inlet<E>>> {
        let inner = self.read();
        inner
            .order
            .first()
            .and_then(|name| inner.nodes.get(name))
            .cloned()
    }

    /// Node names in insertion order.
    pub fn node_names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    /// Inject an entity into the entry node.
    pub async fn start(&self, entity: E) -> Result<()> {
        let entry = self.entry().ok_or_else(|| {
            MeridianError::graph(format!("graph {} has no entry node", self.id()))
        })?;
        entry.accept(entity).await
    }

    /// Stop every node in insertion order, so upstream nodes drain into
    /// downstream nodes that are still running.
    pub async fn stop(&self) {
        let nodes: Vec<Arc<dyn Inlet<E>>> = {
            let inner = self.read();
            inner
                .order
                .iter()
                .filter_map(|name| inner.nodes.get(name).cloned())
                .collect()
        };
        for node in nodes {
            node.stop().await;
        }
        info!(graph_id = %self.id(), "Graph stopped");
    }

    fn insert(&self, node: &Arc<dyn Inlet<E>>) -> Result<bool> {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let name = node.name().to_string();
        match inner.nodes.get(&name) {
            Some(existing) if Arc::ptr_eq(existing, node) => Ok(false),
            Some(_) => Err(MeridianError::graph(format!(
                "graph {} already has a different node named '{name}'",
                inner.id
            ))),
            None => {
                debug!(graph_id = %inner.id, node = %name, "Node added");
                inner.order.push(name.clone());
                inner.nodes.insert(name, Arc::clone(node));
                Ok(true)
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GraphInner<E>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }
}

/// A handle on one node of a graph, used to wire edges.
pub struct Node<E: Entity> {
    graph: Graph<E>,
    inlet: Arc<dyn Inlet<E>>,
}

impl<E: Entity> Node<E> {
    /// The node's name.
    pub fn name(&self) -> &str {
        self.inlet.name()
    }

    /// The underlying inlet.
    pub fn inlet(&self) -> Arc<dyn Inlet<E>> {
        Arc::clone(&self.inlet)
    }

    /// Add an edge from this node to `next`, adding `next` to the graph if
    /// needed. Returns a handle on `next` for chaining; call repeatedly on
    /// the same node to fan out.
    pub fn add_next(&self, next: Arc<dyn Inlet<E>>) -> Result<Node<E>> {
        let downstream = self.inlet.downstream().ok_or_else(|| {
            MeridianError::graph(format!(
                "node '{}' is terminal and cannot have next nodes",
                self.inlet.name()
            ))
        })?;
        self.graph.insert(&next)?;
        downstream.connect(Arc::clone(&next));
        Ok(Node {
            graph: self.graph.clone(),
            inlet: next,
        })
    }
}

/// A terminal node that forwards into another node, possibly of another
/// entity type, after an optional mapping. Returning `None` from the
/// mapping filters the entity out.
pub struct Bridge<A: Entity, B: Entity> {
    name: String,
    target: Arc<dyn Inlet<B>>,
    map: Box<dyn Fn(A) -> Option<B> + Send + Sync>,
    _source: PhantomData<fn(A)>,
}

impl<A: Entity, B: Entity> Bridge<A, B> {
    /// Bridge into `target` through `map`.
    pub fn new(
        name: impl Into<String>,
        target: Arc<dyn Inlet<B>>,
        map: impl Fn(A) -> Option<B> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            target,
            map: Box::new(map),
            _source: PhantomData,
        })
    }

    /// Bridge into the entry node of `graph`.
    pub fn to_graph(
        name: impl Into<String>,
        graph: &Graph<B>,
        map: impl Fn(A) -> Option<B> + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let target = graph.entry().ok_or_else(|| {
            MeridianError::graph(format!("graph {} has no entry node to bridge into", graph.id()))
        })?;
        Ok(Self::new(name, target, map))
    }
}

#[async_trait]
impl<A: Entity, B: Entity> Inlet<A> for Bridge<A, B> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn accept(&self, item: A) -> Result<()> {
        match (self.map)(item) {
            Some(mapped) => self.target.accept(mapped).await,
            None => Ok(()),
        }
    }
}

/// A terminal node that keeps what it receives. Useful as an export tap.
pub struct Probe<E> {
    name: String,
    seen: Mutex<Vec<E>>,
}

impl<E: Entity> Probe<E> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Everything received so far, in arrival order.
    pub fn seen(&self) -> Vec<E> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<E: Entity> Inlet<E> for Probe<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn accept(&self, item: E) -> Result<()> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use meridian_core::config::OverflowPolicy;
    use meridian_core::telemetry::ServiceCallMetrics;
    use meridian_core::types::Downsampling;

    use crate::aggregation::AggregationProcessor;
    use crate::worker::{Worker, WorkerSettings};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            capacity: 64,
            overflow: OverflowPolicy::Block {
                timeout: Duration::from_secs(1),
            },
            stop_grace: Duration::from_secs(5),
        }
    }

    fn call(minute: u32, calls: i64) -> ServiceCallMetrics {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap();
        let mut m = ServiceCallMetrics::observe(ts, "A", 1, 200);
        m.calls = calls;
        m
    }

    fn aggregator(name: &str) -> Arc<Worker<ServiceCallMetrics>> {
        Worker::spawn(name, settings(), AggregationProcessor::new(Duration::from_secs(600)))
    }

    #[tokio::test]
    async fn test_chain_and_fan_out() {
        let graph = Graph::<ServiceCallMetrics>::new(GraphId(300));
        let left = Probe::new("left");
        let right = Probe::new("right");
        let agg = graph.add_node(aggregator("agg")).unwrap();
        agg.add_next(left.clone()).unwrap();
        agg.add_next(right.clone()).unwrap();
        assert_eq!(graph.node_names(), vec!["agg", "left", "right"]);

        for c in [1, 2, 3] {
            graph.start(call(0, c)).await.unwrap();
        }
        graph.stop().await;

        let calls: Vec<i64> = left.seen().iter().map(|m| m.calls).collect();
        assert_eq!(calls, vec![1, 3, 6]);
        assert_eq!(right.len(), 3);
    }

    #[tokio::test]
    async fn test_terminal_node_rejects_next() {
        let graph = Graph::<ServiceCallMetrics>::new(GraphId(301));
        let probe = graph.add_node(Probe::new("tap")).unwrap();
        let err = probe.add_next(Probe::new("other")).err().unwrap();
        assert!(matches!(err, MeridianError::Graph { .. }));
    }

    #[tokio::test]
    async fn test_find_node_and_duplicate_names() {
        let graph = Graph::<ServiceCallMetrics>::new(GraphId(302));
        let tap = Probe::new("tap");
        graph.add_node(tap.clone()).unwrap();
        graph.add_node(tap.clone()).unwrap();
        assert!(graph.add_node(Probe::new("tap")).is_err());

        assert_eq!(graph.find_node("tap").unwrap().name(), "tap");
        assert!(graph.find_node("missing").is_err());
        assert!(Graph::<ServiceCallMetrics>::new(GraphId(9)).start(call(0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_bridge_downsamples_into_other_graph() {
        let minute = Graph::<ServiceCallMetrics>::new(GraphId(303));
        let hour = Graph::<ServiceCallMetrics>::new(GraphId(304));

        let hour_tap = Probe::new("hour-tap");
        hour.add_node(aggregator("hour-agg"))
            .unwrap()
            .add_next(hour_tap.clone())
            .unwrap();

        let bridge = Bridge::to_graph("to-hour", &hour, |m: ServiceCallMetrics| {
            Some(m.downsample(Downsampling::Hour))
        })
        .unwrap();
        minute.add_node(bridge).unwrap();

        minute.start(call(1, 2)).await.unwrap();
        minute.start(call(2, 5)).await.unwrap();
        minute.stop().await;
        hour.stop().await;

        let last = hour_tap.seen().pop().unwrap();
        assert_eq!(last.time_bucket, 2024050112);
        assert_eq!(last.calls, 7);
    }
}
