//! TCP server for inter-node peer messages.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::content::ContentTransport;
use crate::rpc::PeerMessage;
use crate::storage::Storage;
use crate::wire::PeerCodec;
use crate::{handlers, CoordinatorNode};

/// Bind the cluster port. Done before spawning so a port clash surfaces to
/// the caller instead of a background log line.
pub(crate) async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Cluster TCP server listening");
    Ok(listener)
}

pub(crate) fn start_cluster_server<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    listener: TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = node.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "Accepted cluster connection");
                    let node = Arc::clone(&node);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(node, stream).await {
                            debug!(peer = %peer_addr, error = %e, "Cluster connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept cluster connection");
                }
            }
        }
        debug!("Cluster TCP server stopped");
    })
}

async fn handle_connection<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, PeerCodec::new());

    loop {
        let frame = tokio::select! {
            _ = node.shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(msg) = frame else { break };
        let response = dispatch(Arc::clone(&node), msg?).await;
        framed.send(response).await?;
    }

    Ok(())
}

async fn dispatch<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    msg: PeerMessage,
) -> PeerMessage {
    match msg {
        PeerMessage::Ping(ping) => handlers::handle_ping(node, ping).await,
        PeerMessage::Election(election) => handlers::handle_election(node, election).await,
        PeerMessage::Coordinator(coordinator) => {
            handlers::handle_coordinator(node, coordinator).await
        }
        PeerMessage::Puzzle(puzzle) => handlers::handle_puzzle(node, puzzle).await,
        PeerMessage::Claim(claim) => handlers::handle_claim(node, claim).await,
        PeerMessage::MutexRequest(request) => handlers::handle_mutex_request(node, request).await,
        PeerMessage::MutexReply(reply) => handlers::handle_mutex_reply(node, reply).await,
        PeerMessage::Announce(announce) => handlers::handle_announce(node, announce).await,
        PeerMessage::DiscoveryRequest(request) => {
            handlers::handle_discovery_request(node, request).await
        }
        other @ (PeerMessage::Pong(_) | PeerMessage::Alive(_) | PeerMessage::Ack(_)) => {
            error!(kind = ?other.message_type(), "Response-only message received as a request");
            PeerMessage::ack(&node.config.node_id, false)
        }
    }
}
