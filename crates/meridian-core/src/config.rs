//! Pipeline configuration.
//!
//! [`PipelineConfig`] captures a collector node's identity, its storage and
//! remote endpoints, and every tuning knob of the worker engine, the
//! persistence timer and remote dispatch. [`PipelineConfig::new`] fills in
//! defaults; [`PipelineConfig::from_json_file`] loads an operator-supplied
//! file where missing fields fall back to the same defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeridianError;
use crate::types::{NodeId, PeerAddress};
use crate::Result;

/// What a producer experiences when a worker queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait up to `timeout` for space, then fail with `QueueFull`.
    Block { timeout: Duration },
    /// Fail immediately with `QueueFull` and count the drop.
    Drop,
}

/// How entity ids are mapped onto cluster members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStrategy {
    /// Highest-random-weight hashing; only ids owned by a departed member move.
    #[default]
    Rendezvous,
    /// `hash(id) % members`; most ids move when membership changes.
    Modulo,
}

/// Default queue capacity per worker.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default time a blocked producer waits for queue space.
const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default drain grace period on worker stop.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Default persistence period: 25 seconds.
const DEFAULT_PERSISTENT_PERIOD: Duration = Duration::from_secs(25);

/// Default delay before the first persistence cycle.
const DEFAULT_PERSISTENT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Default upper bound for one worker's flush.
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle time after which an aggregate is evicted.
const DEFAULT_AGGREGATION_IDLE_TTL: Duration = Duration::from_secs(600);

/// Default size of each remote client's send buffer.
const DEFAULT_REMOTE_BUFFER_SIZE: usize = 3000;

/// Default number of messages per remote send.
const DEFAULT_REMOTE_BATCH_SIZE: usize = 256;

/// Default deadline for a remote send.
const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default heartbeat interval: 5 seconds.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default dead threshold: 30 seconds (6 missed heartbeats).
const DEFAULT_DEAD_THRESHOLD: Duration = Duration::from_secs(30);

/// Configuration for a Meridian collector node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Address this node's remote server listens on and advertises to peers.
    pub remote_address: PeerAddress,

    /// Storage URI: `"local://~/.meridian/data"`, a raw path, or `"memory://"`.
    pub storage_uri: String,

    /// Bounded queue capacity of every worker.
    pub queue_capacity: usize,

    /// Behaviour when a queue is full.
    pub overflow: OverflowPolicy,

    /// How long `stop()` keeps draining before giving up.
    pub stop_grace: Duration,

    /// Interval between persistence cycles.
    pub persistent_period: Duration,

    /// Delay before the first persistence cycle.
    pub persistent_initial_delay: Duration,

    /// Upper bound on a single worker's flush within one cycle.
    pub flush_timeout: Duration,

    /// Aggregates untouched for this long are evicted from aggregation maps.
    pub aggregation_idle_ttl: Duration,

    /// Buffered messages per remote client before sends start dropping.
    pub remote_buffer_size: usize,

    /// Maximum messages per remote send.
    pub remote_batch_size: usize,

    /// Deadline for one remote send.
    pub remote_timeout: Duration,

    /// Ownership routing strategy.
    pub routing: RoutingStrategy,

    /// Fixed cluster members used when heartbeat membership is disabled.
    pub static_peers: Vec<PeerAddress>,

    /// Interval between heartbeat writes.
    pub heartbeat_interval: Duration,

    /// Duration after which a node with no heartbeat is considered dead.
    pub dead_threshold: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            remote_address: PeerAddress::new("127.0.0.1", 11800),
            storage_uri: "memory://".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::Block {
                timeout: DEFAULT_ENQUEUE_TIMEOUT,
            },
            stop_grace: DEFAULT_STOP_GRACE,
            persistent_period: DEFAULT_PERSISTENT_PERIOD,
            persistent_initial_delay: DEFAULT_PERSISTENT_INITIAL_DELAY,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            aggregation_idle_ttl: DEFAULT_AGGREGATION_IDLE_TTL,
            remote_buffer_size: DEFAULT_REMOTE_BUFFER_SIZE,
            remote_batch_size: DEFAULT_REMOTE_BATCH_SIZE,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            routing: RoutingStrategy::default(),
            static_peers: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            dead_threshold: DEFAULT_DEAD_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with defaults for the given storage URI.
    ///
    /// # Example
    ///
    /// ```
    /// use meridian_core::config::PipelineConfig;
    ///
    /// let config = PipelineConfig::new("memory://");
    /// assert_eq!(config.queue_capacity, 1024);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(storage_uri: impl Into<String>) -> Self {
        Self {
            storage_uri: storage_uri.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| MeridianError::Config {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| MeridianError::Config {
            message: format!("invalid config {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would stall or spin the pipeline.
    pub fn validate(&self) -> Result<()> {
        let nonzero_counts = [
            ("queue_capacity", self.queue_capacity),
            ("remote_buffer_size", self.remote_buffer_size),
            ("remote_batch_size", self.remote_batch_size),
        ];
        for (name, value) in nonzero_counts {
            if value == 0 {
                return Err(MeridianError::Config {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }

        let nonzero_periods = [
            ("persistent_period", self.persistent_period),
            ("flush_timeout", self.flush_timeout),
            ("remote_timeout", self.remote_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
        ];
        for (name, value) in nonzero_periods {
            if value.is_zero() {
                return Err(MeridianError::Config {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }

        if self.dead_threshold <= self.heartbeat_interval {
            return Err(MeridianError::Config {
                message: "dead_threshold must exceed heartbeat_interval".to_string(),
            });
        }
        Ok(())
    }
}
