//! Unified error types for Meridian.
//!
//! All errors in Meridian are represented by [`MeridianError`], using `thiserror`
//! for ergonomic error definitions. Library code never uses `unwrap()`;
//! all fallible operations return `Result<T, MeridianError>`.
//!
//! The pipeline-facing variants map onto the failure classes a worker can hit:
//! backpressure ([`MeridianError::QueueFull`]), schema mismatch
//! ([`MeridianError::EntityShape`]), cross-node dispatch
//! ([`MeridianError::RemoteSend`]) and flush-cycle failure
//! ([`MeridianError::StorageFlush`]). None of them is allowed to cross a
//! worker boundary; workers log and count them.

use crate::types::GraphId;
use thiserror::Error;

/// The unified error type for all Meridian operations.
#[derive(Error, Debug)]
pub enum MeridianError {
    /// A worker queue was full and the item could not be enqueued in time.
    #[error("Queue full for worker {worker} (capacity {capacity})")]
    QueueFull {
        /// Name of the worker whose queue overflowed.
        worker: String,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The worker has been stopped and no longer accepts items.
    #[error("Worker {worker} is stopped")]
    WorkerStopped {
        /// Name of the stopped worker.
        worker: String,
    },

    /// A record did not match the declared schema of its model.
    #[error("Entity shape mismatch for {model}: {message}")]
    EntityShape {
        /// The model (schema) name.
        model: String,
        /// Description of the mismatch.
        message: String,
    },

    /// Sending an entity to a peer node failed.
    #[error("Remote send to {peer} failed: {message}")]
    RemoteSend {
        /// The peer address.
        peer: String,
        /// Description of the failure.
        message: String,
    },

    /// A persistence worker could not complete its flush cycle.
    #[error("Flush failed for worker {worker}: {message}")]
    StorageFlush {
        /// Name of the persistence worker.
        worker: String,
        /// Description of the failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested key was not found in storage.
    #[error("Not found: {key}")]
    NotFound {
        /// The storage key that was not found.
        key: String,
    },

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The positional wire message could not be encoded or decoded.
    #[error("Codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// A graph was wired incorrectly (unknown node, terminal node with next, ...).
    #[error("Graph error: {message}")]
    Graph {
        /// Description of the wiring problem.
        message: String,
    },

    /// A graph id was reused with a different entity type.
    #[error("Graph {graph_id} holds {found}, requested {expected}")]
    GraphTypeMismatch {
        /// The graph id.
        graph_id: GraphId,
        /// The entity type requested by the caller.
        expected: &'static str,
        /// The entity type the graph was created with.
        found: &'static str,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An operation did not complete within its deadline.
    #[error("Timeout: {message}")]
    Timeout {
        /// Description of the timed-out operation.
        message: String,
    },

    /// An internal error (bug).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl MeridianError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create an entity shape error for the given model.
    pub fn shape(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EntityShape {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Create a graph wiring error.
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    /// Whether this error is a schema mismatch (record rejected, not a processing failure).
    pub fn is_shape(&self) -> bool {
        matches!(self, Self::EntityShape { .. })
    }
}

impl From<serde_json::Error> for MeridianError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MeridianError::QueueFull {
            worker: "svc-agg".into(),
            capacity: 8,
        };
        assert_eq!(err.to_string(), "Queue full for worker svc-agg (capacity 8)");

        let err = MeridianError::shape("service_call", "expected 6 columns, got 5");
        assert!(err.is_shape());
        assert!(err.to_string().contains("service_call"));
    }

    #[test]
    fn test_storage_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = MeridianError::storage("write failed", io);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("disk gone"));
    }

    #[test]
    fn test_graph_type_mismatch_display() {
        let err = MeridianError::GraphTypeMismatch {
            graph_id: GraphId(302),
            expected: "A",
            found: "B",
        };
        assert_eq!(err.to_string(), "Graph 302 holds B, requested A");
    }
}
