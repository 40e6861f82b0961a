//! The receiving end of remote dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use meridian_core::error::MeridianError;
use meridian_core::wire::RemoteMessage;
use meridian_core::Result;

use crate::registry::GraphRegistry;

/// Receive-side counters, mirroring the sender's `out` / `out_error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveStats {
    /// Messages received, including failed ones.
    #[serde(rename = "in")]
    pub inbound: u64,
    /// Messages that could not be injected.
    pub in_error: u64,
}

/// Decodes incoming messages and injects them into local graphs.
pub struct RemoteReceiveService {
    registry: Arc<GraphRegistry>,
    inbound: AtomicU64,
    in_error: AtomicU64,
}

impl RemoteReceiveService {
    pub fn new(registry: Arc<GraphRegistry>) -> Self {
        Self {
            registry,
            inbound: AtomicU64::new(0),
            in_error: AtomicU64::new(0),
        }
    }

    /// Inject one message. Unknown graphs and undecodable payloads are errors.
    pub async fn receive_one(&self, message: RemoteMessage) -> Result<()> {
        self.inbound.fetch_add(1, Ordering::Relaxed);
        let graph_id = message.graph_id;
        let outcome = match self.registry.erased(graph_id) {
            Some(graph) => graph.inject(message.data).await,
            None => Err(MeridianError::graph(format!("no graph registered under id {graph_id}"))),
        };
        if outcome.is_err() {
            self.in_error.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Inject a batch. Failures are logged and counted per message; the
    /// rest of the batch still goes through. Returns how many were accepted.
    pub async fn receive(&self, batch: Vec<RemoteMessage>) -> usize {
        let mut accepted = 0;
        for message in batch {
            let graph_id = message.graph_id;
            match self.receive_one(message).await {
                Ok(()) => accepted += 1,
                Err(e) => warn!(graph_id = %graph_id, error = %e, "Dropped remote message"),
            }
        }
        accepted
    }

    pub fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            inbound: self.inbound.load(Ordering::Relaxed),
            in_error: self.in_error.load(Ordering::Relaxed),
        }
    }
}
