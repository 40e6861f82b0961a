//! Cluster transport abstraction used by remote dispatch.

use async_trait::async_trait;

use crate::types::PeerAddress;
use crate::wire::RemoteMessage;
use crate::Result;

/// Delivers batches of positional messages to a peer node.
///
/// Implementations keep a persistent channel per peer; a failed send must
/// leave the transport usable for the next call.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Send `batch` to `target`. The batch is delivered whole or the call errors.
    async fn send(&self, target: &PeerAddress, batch: Vec<RemoteMessage>) -> Result<()>;

    /// Drop any connection held for `target`.
    async fn disconnect(&self, _target: &PeerAddress) {}
}
