//! Peer-to-peer message types.
//!
//! Every payload carries a [`Header`]; framing (magic + type byte) lives in
//! [`crate::wire`].

use serde::{Deserialize, Serialize};

/// Common payload prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Header {
    pub sender_id: String,
    /// Wall-clock unix millis, or the Lamport timestamp on mutex messages.
    pub timestamp: u64,
}

impl Header {
    pub fn now(sender_id: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            timestamp: crate::unix_millis(),
        }
    }

    pub fn lamport(sender_id: &str, timestamp: u64) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Ping(Ping),
    Pong(Pong),
    Election(Election),
    Alive(Alive),
    Coordinator(Coordinator),
    Puzzle(Puzzle),
    Claim(Claim),
    MutexRequest(MutexRequest),
    MutexReply(MutexReply),
    Announce(Announce),
    DiscoveryRequest(DiscoveryRequest),
    Ack(Ack),
}

impl PeerMessage {
    pub fn header(&self) -> &Header {
        match self {
            PeerMessage::Ping(m) => &m.header,
            PeerMessage::Pong(m) => &m.header,
            PeerMessage::Election(m) => &m.header,
            PeerMessage::Alive(m) => &m.header,
            PeerMessage::Coordinator(m) => &m.header,
            PeerMessage::Puzzle(m) => &m.header,
            PeerMessage::Claim(m) => &m.header,
            PeerMessage::MutexRequest(m) => &m.header,
            PeerMessage::MutexReply(m) => &m.header,
            PeerMessage::Announce(m) => &m.header,
            PeerMessage::DiscoveryRequest(m) => &m.header,
            PeerMessage::Ack(m) => &m.header,
        }
    }

    pub fn ack(sender_id: &str, accepted: bool) -> Self {
        PeerMessage::Ack(Ack {
            header: Header::now(sender_id),
            accepted,
        })
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ping {
    pub header: Header,
    /// Sender's advertised cluster address, so the receiver can register it.
    pub address: String,
    pub can_be_master: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pong {
    pub header: Header,
}

// ============================================================================
// Election
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Election {
    pub header: Header,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Alive {
    pub header: Header,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Coordinator {
    pub header: Header,
    pub leader_id: String,
    pub term: u64,
}

/// Proof-of-work challenge broadcast by the initiator of a round.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Puzzle {
    pub header: Header,
    pub term: u64,
    pub challenge: String,
    pub difficulty: u32,
}

/// A leadership claim backed by a puzzle solution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Claim {
    pub header: Header,
    pub term: u64,
    pub challenge: String,
    pub difficulty: u32,
    pub nonce: u64,
}

// ============================================================================
// Mutex
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MutexRequest {
    pub header: Header,
    pub resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MutexReply {
    pub header: Header,
    pub resource_id: String,
    /// Lamport timestamp of the request being answered.
    pub request_timestamp: u64,
}

// ============================================================================
// Discovery
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Announce {
    pub header: Header,
    pub address: String,
    pub can_be_master: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiscoveryRequest {
    pub header: Header,
    pub address: String,
    pub can_be_master: bool,
}

/// Generic response for one-way notifications.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ack {
    pub header: Header,
    pub accepted: bool,
}
