//! TCP transport layer for inter-node messages.
//!
//! Each peer gets a pool of dedicated background tasks, each owning its own
//! TCP connection. Requests are distributed across the pool via round-robin.
//! Every request waits for exactly one response frame, bounded by the
//! request timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::rpc::PeerMessage;
use crate::wire::{PeerCodec, WireError};

/// Number of TCP connections per peer.
const POOL_SIZE: usize = 4;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(std::io::Error),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Peer task unavailable")]
    PeerUnavailable,
    #[error("Request timed out")]
    Timeout,
}

type PeerConnection = Framed<TcpStream, PeerCodec>;
type PeerRequest = (PeerMessage, oneshot::Sender<Result<PeerMessage, TransportError>>);

struct PeerHandle {
    senders: Vec<mpsc::Sender<PeerRequest>>,
    next: AtomicUsize,
}

impl PeerHandle {
    fn pick_sender(&self) -> Option<mpsc::Sender<PeerRequest>> {
        let len = self.senders.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..len {
            let idx = (start + i) % len;
            let tx = &self.senders[idx];
            if !tx.is_closed() {
                return Some(tx.clone());
            }
        }
        None
    }
}

/// Manages outbound TCP connections to cluster peers.
///
/// Peer addresses are cluster TCP addresses (host:cluster_port).
pub struct ClusterTransport {
    peers: RwLock<HashMap<String, PeerHandle>>,
    request_timeout: Duration,
}

impl ClusterTransport {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            request_timeout,
        })
    }

    /// Send a message and wait for the peer's response.
    pub async fn send(
        &self,
        peer_addr: &str,
        message: PeerMessage,
    ) -> Result<PeerMessage, TransportError> {
        let tx = self.get_or_spawn_peer(peer_addr).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((message, reply_tx))
            .await
            .map_err(|_| TransportError::PeerUnavailable)?;

        // The connection task enforces the per-attempt timeout; this bounds
        // the queueing delay in front of it as well.
        match tokio::time::timeout(self.request_timeout * 3, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::PeerUnavailable),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Remove a peer's connection pool.
    pub async fn disconnect(&self, peer_addr: &str) {
        self.peers.write().await.remove(peer_addr);
    }

    async fn get_or_spawn_peer(
        &self,
        peer_addr: &str,
    ) -> Result<mpsc::Sender<PeerRequest>, TransportError> {
        {
            let peers = self.peers.read().await;
            if let Some(handle) = peers.get(peer_addr) {
                if let Some(tx) = handle.pick_sender() {
                    return Ok(tx);
                }
            }
        }

        let mut peers = self.peers.write().await;
        if let Some(handle) = peers.get(peer_addr) {
            if let Some(tx) = handle.pick_sender() {
                return Ok(tx);
            }
        }

        let handle = spawn_peer_pool(peer_addr.to_string(), self.request_timeout);
        let tx = handle.pick_sender().ok_or(TransportError::PeerUnavailable)?;
        peers.insert(peer_addr.to_string(), handle);
        Ok(tx)
    }
}

impl std::fmt::Debug for ClusterTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTransport")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn spawn_peer_pool(addr: String, request_timeout: Duration) -> PeerHandle {
    let mut senders = Vec::with_capacity(POOL_SIZE);

    for conn_idx in 0..POOL_SIZE {
        let (tx, mut rx) = mpsc::channel::<PeerRequest>(64);
        let addr = addr.clone();

        tokio::spawn(async move {
            let mut conn: Option<PeerConnection> = None;

            while let Some((message, reply_tx)) = rx.recv().await {
                let result = peer_send_recv(&mut conn, &addr, message, request_timeout).await;
                let _ = reply_tx.send(result);
            }

            debug!(peer = %addr, conn_idx, "Peer pool task exiting (channel closed)");
        });

        senders.push(tx);
    }

    PeerHandle {
        senders,
        next: AtomicUsize::new(0),
    }
}

async fn peer_send_recv(
    conn: &mut Option<PeerConnection>,
    addr: &str,
    message: PeerMessage,
    request_timeout: Duration,
) -> Result<PeerMessage, TransportError> {
    let mut stream = match conn.take() {
        Some(stream) => stream,
        None => connect(addr, request_timeout).await?,
    };

    match tokio::time::timeout(request_timeout, send_and_recv(&mut stream, message.clone())).await {
        Ok(Ok(resp)) => {
            *conn = Some(stream);
            Ok(resp)
        }
        Ok(Err(_)) => {
            debug!(peer = %addr, "Connection lost, reconnecting");
            let mut fresh = connect(addr, request_timeout).await?;
            let resp = tokio::time::timeout(request_timeout, send_and_recv(&mut fresh, message))
                .await
                .map_err(|_| TransportError::Timeout)??;
            *conn = Some(fresh);
            Ok(resp)
        }
        // A stream that timed out may still deliver the late response; drop it
        // so replies cannot get out of step with requests.
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn connect(addr: &str, request_timeout: Duration) -> Result<PeerConnection, TransportError> {
    debug!(peer = %addr, "Connecting to peer");
    let stream = tokio::time::timeout(request_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Connect)?;
    stream.set_nodelay(true).map_err(TransportError::Connect)?;

    Ok(Framed::new(stream, PeerCodec::new()))
}

async fn send_and_recv(
    conn: &mut PeerConnection,
    message: PeerMessage,
) -> Result<PeerMessage, TransportError> {
    conn.send(message).await?;

    match conn.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(_)) => Err(TransportError::ConnectionClosed),
        None => Err(TransportError::ConnectionClosed),
    }
}
