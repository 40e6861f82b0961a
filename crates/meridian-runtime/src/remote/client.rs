//! Per-peer remote clients.
//!
//! The client for the local node hands messages straight to the receive
//! service. Clients for peers buffer into a bounded channel drained by a
//! dedicated sender task, so a slow peer never stalls the worker that
//! dispatched to it: when the buffer is full the message is dropped and
//! counted instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use meridian_core::error::MeridianError;
use meridian_core::transport::RemoteTransport;
use meridian_core::types::PeerAddress;
use meridian_core::wire::RemoteMessage;
use meridian_core::Result;

use crate::remote::receiver::RemoteReceiveService;
use crate::wait_for_cancel;

/// Counters of one remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteClientStats {
    pub peer: String,
    pub out: u64,
    pub out_error: u64,
    pub dropped: u64,
    pub buffered: usize,
}

#[derive(Debug, Default)]
struct ClientCounters {
    out: AtomicU64,
    out_error: AtomicU64,
    dropped: AtomicU64,
}

/// A channel to one cluster member.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    fn address(&self) -> &PeerAddress;

    /// Whether the member is this node.
    fn is_local(&self) -> bool;

    /// Queue one message for delivery. Never waits on the network.
    async fn push(&self, message: RemoteMessage) -> Result<()>;

    /// Stop the client, sending what is still buffered.
    async fn close(&self);

    fn stats(&self) -> RemoteClientStats;
}

// ---------------------------------------------------------------------------
// SelfClient
// ---------------------------------------------------------------------------

/// The client for the local node: delivery is an in-process call.
pub struct SelfClient {
    address: PeerAddress,
    service: Arc<RemoteReceiveService>,
    out: AtomicU64,
    out_error: AtomicU64,
}

impl SelfClient {
    pub fn new(address: PeerAddress, service: Arc<RemoteReceiveService>) -> Self {
        Self {
            address,
            service,
            out: AtomicU64::new(0),
            out_error: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl RemoteClient for SelfClient {
    fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn push(&self, message: RemoteMessage) -> Result<()> {
        match self.service.receive_one(message).await {
            Ok(()) => {
                self.out.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.out_error.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn close(&self) {}

    fn stats(&self) -> RemoteClientStats {
        RemoteClientStats {
            peer: self.address.to_string(),
            out: self.out.load(Ordering::Relaxed),
            out_error: self.out_error.load(Ordering::Relaxed),
            dropped: 0,
            buffered: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamingClient
// ---------------------------------------------------------------------------

/// Sender-side tuning of a streaming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingSettings {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub timeout: Duration,
}

/// A buffered client for a peer node.
pub struct StreamingClient {
    address: PeerAddress,
    tx: mpsc::Sender<RemoteMessage>,
    counters: Arc<ClientCounters>,
    cancel_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingClient {
    /// Create the client and spawn its sender task. Must be called within a
    /// Tokio runtime.
    pub fn new(
        address: PeerAddress,
        transport: Arc<dyn RemoteTransport>,
        settings: StreamingSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.buffer_size.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let counters = Arc::new(ClientCounters::default());
        let sender = Sender {
            address: address.clone(),
            transport,
            rx,
            counters: Arc::clone(&counters),
            batch_size: settings.batch_size.max(1),
            timeout: settings.timeout,
            cancel: cancel_rx,
        };
        let handle = tokio::spawn(sender.run());
        Self {
            address,
            tx,
            counters,
            cancel_tx,
            task: Mutex::new(Some(handle)),
        }
    }

    fn send_error(&self, message: &str) -> MeridianError {
        MeridianError::RemoteSend {
            peer: self.address.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl RemoteClient for StreamingClient {
    fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn push(&self, message: RemoteMessage) -> Result<()> {
        self.tx.try_send(message).map_err(|e| {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) => self.send_error("send buffer full"),
                TrySendError::Closed(_) => self.send_error("client closed"),
            }
        })
    }

    async fn close(&self) {
        let _ = self.cancel_tx.send(true);
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(peer = %self.address, error = %e, "Remote sender task failed");
            }
        }
    }

    fn stats(&self) -> RemoteClientStats {
        RemoteClientStats {
            peer: self.address.to_string(),
            out: self.counters.out.load(Ordering::Relaxed),
            out_error: self.counters.out_error.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            buffered: self.tx.max_capacity() - self.tx.capacity(),
        }
    }
}

struct Sender {
    address: PeerAddress,
    transport: Arc<dyn RemoteTransport>,
    rx: mpsc::Receiver<RemoteMessage>,
    counters: Arc<ClientCounters>,
    batch_size: usize,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl Sender {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = wait_for_cancel(&self.cancel) => break,
                first = self.rx.recv() => match first {
                    Some(first) => {
                        let batch = self.fill(vec![first]);
                        self.send(batch).await;
                    }
                    None => break,
                },
            }
        }

        self.rx.close();
        loop {
            let batch = self.fill(Vec::new());
            if batch.is_empty() {
                break;
            }
            self.send(batch).await;
        }
        self.transport.disconnect(&self.address).await;
        debug!(peer = %self.address, "Remote sender stopped");
    }

    fn fill(&mut self, mut batch: Vec<RemoteMessage>) -> Vec<RemoteMessage> {
        while batch.len() < self.batch_size {
            match self.rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }
        batch
    }

    async fn send(&self, batch: Vec<RemoteMessage>) {
        let count = batch.len() as u64;
        let outcome = tokio::time::timeout(self.timeout, self.transport.send(&self.address, batch)).await;
        let failure = match outcome {
            Ok(Ok(())) => {
                self.counters.out.fetch_add(count, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("send exceeded {:?}", self.timeout),
        };
        self.counters.out_error.fetch_add(count, Ordering::Relaxed);
        warn!(peer = %self.address, messages = count, error = %failure, "Remote send failed");
    }
}
