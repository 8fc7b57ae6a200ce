//! Heartbeat sender and failure checker.
//!
//! Every node pings every known peer each interval; a PONG counts as a
//! heartbeat. A separate checker runs the failure detector on the same
//! cadence so peers that stop answering are marked down.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::content::ContentTransport;
use crate::detector::PeerEntry;
use crate::rpc::{Header, PeerMessage, Ping};
use crate::storage::Storage;
use crate::CoordinatorNode;

pub(crate) fn start_heartbeat_task<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
) -> JoinHandle<()> {
    let heartbeat_interval = node.config.heartbeat_interval;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        loop {
            tokio::select! {
                _ = node.shutdown.cancelled() => break,
                _ = interval.tick() => send_heartbeats(&node).await,
            }
        }
        debug!("Heartbeat task stopped");
    })
}

async fn send_heartbeats<T: Storage, C: ContentTransport>(node: &Arc<CoordinatorNode<T, C>>) {
    for peer in node.detector.entries().await {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            heartbeat_peer(&node, &peer).await;
        });
    }
}

async fn heartbeat_peer<T: Storage, C: ContentTransport>(
    node: &CoordinatorNode<T, C>,
    peer: &PeerEntry,
) {
    let ping = PeerMessage::Ping(Ping {
        header: Header::now(&node.config.node_id),
        address: node.advertise_address.clone(),
        can_be_master: node.config.can_be_master,
    });

    match node.transport.send(&peer.address, ping).await {
        Ok(PeerMessage::Pong(pong)) => {
            trace!(peer = %peer.node_id, "PONG received");
            node.detector.record_heartbeat(&pong.header.sender_id).await;
        }
        Ok(other) => {
            warn!(peer = %peer.node_id, kind = ?other.message_type(), "Unexpected heartbeat response");
        }
        Err(e) => {
            // Silence is handled by the checker; drop the pool so the next
            // ping reconnects.
            trace!(peer = %peer.node_id, error = %e, "Heartbeat failed");
            node.transport.disconnect(&peer.address).await;
        }
    }
}

pub(crate) fn start_failure_checker<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
) -> JoinHandle<()> {
    let check_interval = node.config.heartbeat_interval;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = node.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let master = node.election.current_master().await;
            let down = node.detector.detect_failures(master.as_deref()).await;
            if !down.is_empty() {
                debug!(peers = ?down, "Failure check marked peers offline");
            }
        }
        debug!("Failure checker stopped");
    })
}
