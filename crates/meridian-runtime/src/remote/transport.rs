//! Concrete [`RemoteTransport`]s.
//!
//! [`TcpTransport`] keeps one persistent connection per peer and writes
//! length-prefixed frames (see [`meridian_core::wire`]). Each peer has its
//! own lock, so a peer that stops reading only stalls sends to itself.
//! [`RemoteServer`] is
//! the listening side that feeds a [`RemoteReceiveService`].
//! [`LoopbackTransport`] delivers in-process and backs multi-node tests and
//! the solo demo.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use meridian_core::error::MeridianError;
use meridian_core::transport::RemoteTransport;
use meridian_core::types::PeerAddress;
use meridian_core::wire::{decode_frame_body, encode_frame, RemoteMessage, MAX_FRAME_LEN};
use meridian_core::Result;

use crate::remote::receiver::RemoteReceiveService;
use crate::wait_for_cancel;

fn send_error(peer: &PeerAddress, message: impl Into<String>) -> MeridianError {
    MeridianError::RemoteSend {
        peer: peer.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// The connection to one peer; `None` until first use or after a failure.
type PeerSlot = Arc<Mutex<Option<TcpStream>>>;

/// Persistent TCP connections, one per peer, opened on first use.
#[derive(Default)]
pub struct TcpTransport {
    peers: RwLock<HashMap<PeerAddress, PeerSlot>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, target: &PeerAddress) -> PeerSlot {
        if let Some(slot) = self.peers.read().unwrap_or_else(|p| p.into_inner()).get(target) {
            return Arc::clone(slot);
        }
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(peers.entry(target.clone()).or_default())
    }

    /// Whether a connection to `target` is currently open.
    pub async fn is_connected(&self, target: &PeerAddress) -> bool {
        let slot = self.peers.read().unwrap_or_else(|p| p.into_inner()).get(target).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }
}

#[async_trait]
impl RemoteTransport for TcpTransport {
    async fn send(&self, target: &PeerAddress, batch: Vec<RemoteMessage>) -> Result<()> {
        let frame = encode_frame(&batch)?;
        let slot = self.slot(target);
        let mut connection = slot.lock().await;

        // The stream is out of its slot while the frame is written. A write
        // that fails or is cancelled drops it, so no partial frame is ever
        // followed by another one on the same connection.
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect((target.host.as_str(), target.port))
                    .await
                    .map_err(|e| send_error(target, format!("connect failed: {e}")))?;
                stream.set_nodelay(true).ok();
                debug!(peer = %target, "Remote connection opened");
                stream
            }
        };
        stream
            .write_all(&frame)
            .await
            .map_err(|e| send_error(target, format!("write failed: {e}")))?;
        *connection = Some(stream);
        Ok(())
    }

    async fn disconnect(&self, target: &PeerAddress) {
        let slot = self
            .peers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(target);
        let Some(slot) = slot else {
            return;
        };
        let stream = slot.lock().await.take();
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
            debug!(peer = %target, "Remote connection closed");
        }
    }
}

/// Accepts peer connections and hands decoded batches to the receive service.
pub struct RemoteServer {
    listener: TcpListener,
    service: Arc<RemoteReceiveService>,
}

impl RemoteServer {
    pub async fn bind(addr: &str, service: Arc<RemoteReceiveService>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| MeridianError::Config {
            message: format!("cannot listen on {addr}: {e}"),
        })?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| MeridianError::Internal {
                message: format!("listener has no address: {e}"),
            })
    }

    /// Accept connections until cancelled.
    pub async fn run(self, cancel: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "Remote server listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&self.service);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                outcome = read_frames(stream, &service) => {
                                    if let Err(e) = outcome {
                                        warn!(peer = %peer, error = %e, "Remote connection failed");
                                    }
                                }
                                _ = wait_for_cancel(&cancel) => {}
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                _ = wait_for_cancel(&cancel) => {
                    debug!("Remote server stopping");
                    break;
                }
            }
        }
    }
}

async fn read_frames(stream: TcpStream, service: &RemoteReceiveService) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(MeridianError::codec(format!("frame header: {e}"))),
        };
        if len > MAX_FRAME_LEN {
            return Err(MeridianError::codec(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| MeridianError::codec(format!("frame body: {e}")))?;
        let batch = decode_frame_body(&body)?;
        service.receive(batch).await;
    }
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

/// In-process transport: a map from address to receive service.
#[derive(Default)]
pub struct LoopbackTransport {
    peers: RwLock<HashMap<PeerAddress, Arc<RemoteReceiveService>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: PeerAddress, service: Arc<RemoteReceiveService>) {
        self.peers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(address, service);
    }

    /// Make `address` unreachable, as if the node went down.
    pub fn unregister(&self, address: &PeerAddress) {
        self.peers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(address);
    }
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    async fn send(&self, target: &PeerAddress, batch: Vec<RemoteMessage>) -> Result<()> {
        let service = self
            .peers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(target)
            .cloned()
            .ok_or_else(|| send_error(target, "peer unreachable"))?;
        service.receive(batch).await;
        Ok(())
    }
}
