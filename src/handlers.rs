//! Incoming peer message handlers.
//!
//! Each function takes `Arc<CoordinatorNode<T, C>>` + a request payload and
//! returns the single response frame. The TCP server dispatches incoming
//! `PeerMessage` variants here.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::content::ContentTransport;
use crate::rpc::{
    Announce, Claim, Coordinator, DiscoveryRequest, Election, Header, MutexReply, MutexRequest,
    PeerMessage, Ping, Pong, Puzzle,
};
use crate::storage::Storage;
use crate::CoordinatorNode;

// ============================================================================
// Heartbeat
// ============================================================================

pub(crate) async fn handle_ping<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    ping: Ping,
) -> PeerMessage {
    let sender = &ping.header.sender_id;
    node.remember_peer(sender, &ping.address, ping.can_be_master)
        .await;
    node.detector.record_heartbeat(sender).await;

    PeerMessage::Pong(Pong {
        header: Header::now(&node.config.node_id),
    })
}

// ============================================================================
// Election
// ============================================================================

pub(crate) async fn handle_election<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    msg: Election,
) -> PeerMessage {
    let peers = node.detector.reachable_entries().await;
    node.election
        .handle_election(&msg.header.sender_id, msg.term, peers)
        .await
}

pub(crate) async fn handle_coordinator<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    msg: Coordinator,
) -> PeerMessage {
    let peers = node.detector.reachable_entries().await;
    node.election
        .handle_coordinator(&msg.leader_id, msg.term, peers)
        .await
}

pub(crate) async fn handle_puzzle<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    msg: Puzzle,
) -> PeerMessage {
    let peers = node.detector.reachable_entries().await;
    node.election.handle_puzzle(msg, peers).await
}

pub(crate) async fn handle_claim<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    msg: Claim,
) -> PeerMessage {
    node.election.handle_claim(&msg).await
}

// ============================================================================
// Mutex
// ============================================================================

pub(crate) async fn handle_mutex_request<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    request: MutexRequest,
) -> PeerMessage {
    let sender = &request.header.sender_id;
    let Some(address) = node.detector.address_of(sender).await else {
        // A deferred reply needs somewhere to go.
        warn!(peer = %sender, resource = %request.resource_id, "Mutex request from unknown peer");
        return PeerMessage::ack(&node.config.node_id, false);
    };
    node.mutex.handle_request(&request, &address).await
}

pub(crate) async fn handle_mutex_reply<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    reply: MutexReply,
) -> PeerMessage {
    node.mutex.handle_reply(&reply).await
}

// ============================================================================
// Discovery
// ============================================================================

pub(crate) async fn handle_announce<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    announce: Announce,
) -> PeerMessage {
    let added = node
        .remember_peer(
            &announce.header.sender_id,
            &announce.address,
            announce.can_be_master,
        )
        .await;
    PeerMessage::ack(&node.config.node_id, added)
}

pub(crate) async fn handle_discovery_request<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    request: DiscoveryRequest,
) -> PeerMessage {
    debug!(peer = %request.header.sender_id, address = %request.address, "Discovery request");
    node.remember_peer(
        &request.header.sender_id,
        &request.address,
        request.can_be_master,
    )
    .await;

    PeerMessage::Announce(Announce {
        header: Header::now(&node.config.node_id),
        address: node.advertise_address.clone(),
        can_be_master: node.config.can_be_master,
    })
}
