//! Heartbeat-based failure detection.
//!
//! Each known peer moves UNKNOWN -> ONLINE on its first heartbeat, ONLINE ->
//! OFFLINE once `timeout` passes without one, and back to ONLINE on the next
//! heartbeat. Transitions into OFFLINE are reported exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::events::{ClusterEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Unknown,
    Online,
    Offline,
}

/// Liveness state of a single peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub node_id: String,
    pub address: String,
    pub can_be_master: bool,
    /// Time of the last heartbeat, or of first registration if none arrived yet.
    pub last_seen: Instant,
    pub missed_beats: u32,
    pub status: PeerStatus,
}

impl PeerState {
    fn new(node_id: &str, address: &str, can_be_master: bool, now: Instant) -> Self {
        Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            can_be_master,
            last_seen: now,
            missed_beats: 0,
            status: PeerStatus::Unknown,
        }
    }

    /// Apply a heartbeat. Returns true if the peer came (back) online.
    pub fn record_heartbeat(&mut self, now: Instant) -> bool {
        let came_up = self.status != PeerStatus::Online;
        self.last_seen = now;
        self.missed_beats = 0;
        self.status = PeerStatus::Online;
        came_up
    }

    /// Returns true only on the transition into OFFLINE.
    pub fn check_timeout(&mut self, timeout: Duration, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_seen) <= timeout {
            return false;
        }
        self.missed_beats = self.missed_beats.saturating_add(1);
        if self.status == PeerStatus::Offline {
            return false;
        }
        self.status = PeerStatus::Offline;
        true
    }
}

/// Addressing facts about a peer, without liveness. This is what gets
/// persisted and what other components receive as a membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: String,
    pub address: String,
    pub can_be_master: bool,
}

/// Peer table with per-peer heartbeat state.
#[derive(Debug)]
pub struct FailureDetector {
    peers: RwLock<HashMap<String, PeerState>>,
    timeout: Duration,
    events: EventBus,
}

impl FailureDetector {
    pub fn new(timeout: Duration, events: EventBus) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            timeout,
            events,
        }
    }

    /// Register a peer if it is not known yet. Known peers get their address
    /// and eligibility refreshed.
    pub async fn register_peer(&self, node_id: &str, address: &str, can_be_master: bool) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(node_id) {
            Some(peer) => {
                peer.address = address.to_string();
                peer.can_be_master = can_be_master;
                false
            }
            None => {
                peers.insert(
                    node_id.to_string(),
                    PeerState::new(node_id, address, can_be_master, Instant::now()),
                );
                info!(peer = %node_id, address = %address, "Registered peer");
                true
            }
        }
    }

    pub async fn record_heartbeat(&self, node_id: &str) {
        self.record_heartbeat_at(node_id, Instant::now()).await;
    }

    pub async fn record_heartbeat_at(&self, node_id: &str, now: Instant) {
        let came_up = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(node_id) {
                Some(peer) => peer.record_heartbeat(now),
                None => {
                    debug!(peer = %node_id, "Heartbeat from unregistered peer ignored");
                    return;
                }
            }
        };
        if came_up {
            info!(peer = %node_id, "Peer online");
            self.events.publish(ClusterEvent::NodeUp(node_id.to_string()));
        }
    }

    /// Check a single peer. Returns true exactly on the transition into OFFLINE.
    pub async fn check_timeout(&self, node_id: &str, timeout: Duration) -> bool {
        let mut peers = self.peers.write().await;
        peers
            .get_mut(node_id)
            .map(|p| p.check_timeout(timeout, Instant::now()))
            .unwrap_or(false)
    }

    /// Check every peer, publish `NodeDown` for each new transition and
    /// `MasterDown` if `current_master` is among them. Returns the peers that
    /// just went offline.
    pub async fn detect_failures(&self, current_master: Option<&str>) -> Vec<String> {
        self.detect_failures_at(current_master, Instant::now()).await
    }

    pub async fn detect_failures_at(&self, current_master: Option<&str>, now: Instant) -> Vec<String> {
        let mut down: Vec<String> = {
            let mut peers = self.peers.write().await;
            peers
                .values_mut()
                .filter_map(|p| p.check_timeout(self.timeout, now).then(|| p.node_id.clone()))
                .collect()
        };
        down.sort();

        for peer in &down {
            warn!(peer = %peer, "Peer offline");
            self.events.publish(ClusterEvent::NodeDown(peer.clone()));
            if current_master == Some(peer.as_str()) {
                warn!(master = %peer, "Master offline");
                self.events.publish(ClusterEvent::MasterDown(peer.clone()));
            }
        }
        down
    }

    pub async fn peer(&self, node_id: &str) -> Option<PeerState> {
        self.peers.read().await.get(node_id).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerState> {
        let mut peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub async fn address_of(&self, node_id: &str) -> Option<String> {
        self.peers.read().await.get(node_id).map(|p| p.address.clone())
    }

    /// Peers currently ONLINE.
    pub async fn online_peers(&self) -> Vec<String> {
        self.peers_where(|p| p.status == PeerStatus::Online).await
    }

    /// Peers not known to be OFFLINE.
    pub async fn reachable_peers(&self) -> Vec<String> {
        self.peers_where(|p| p.status != PeerStatus::Offline).await
    }

    pub async fn offline_peers(&self) -> Vec<String> {
        self.peers_where(|p| p.status == PeerStatus::Offline).await
    }

    async fn peers_where<F: Fn(&PeerState) -> bool>(&self, pred: F) -> Vec<String> {
        let mut ids: Vec<_> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| pred(p))
            .map(|p| p.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every known peer.
    pub async fn entries(&self) -> Vec<PeerEntry> {
        self.entries_where(|_| true).await
    }

    /// Peers not known to be OFFLINE.
    pub async fn reachable_entries(&self) -> Vec<PeerEntry> {
        self.entries_where(|p| p.status != PeerStatus::Offline).await
    }

    async fn entries_where<F: Fn(&PeerState) -> bool>(&self, pred: F) -> Vec<PeerEntry> {
        self.peers()
            .await
            .into_iter()
            .filter(|p| pred(p))
            .map(|p| PeerEntry {
                node_id: p.node_id,
                address: p.address,
                can_be_master: p.can_be_master,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> (FailureDetector, EventBus) {
        let events = EventBus::new();
        (FailureDetector::new(Duration::from_secs(15), events.clone()), events)
    }

    #[test]
    fn test_peer_state_transitions() {
        let t0 = Instant::now();
        let mut peer = PeerState::new("b", "127.0.0.1:1", true, t0);
        assert_eq!(peer.status, PeerStatus::Unknown);

        assert!(peer.record_heartbeat(t0));
        assert_eq!(peer.status, PeerStatus::Online);

        let timeout = Duration::from_secs(15);
        assert!(!peer.check_timeout(timeout, t0 + Duration::from_secs(10)));
        assert!(peer.check_timeout(timeout, t0 + Duration::from_secs(16)));
        assert_eq!(peer.status, PeerStatus::Offline);
        assert_eq!(peer.missed_beats, 1);

        // Already offline: does not fire again.
        assert!(!peer.check_timeout(timeout, t0 + Duration::from_secs(30)));
        assert_eq!(peer.missed_beats, 2);

        // Next heartbeat resets.
        assert!(peer.record_heartbeat(t0 + Duration::from_secs(31)));
        assert_eq!(peer.missed_beats, 0);
        assert_eq!(peer.status, PeerStatus::Online);
        assert!(!peer.record_heartbeat(t0 + Duration::from_secs(32)));
    }

    #[test]
    fn test_unknown_peer_can_time_out() {
        let t0 = Instant::now();
        let mut peer = PeerState::new("b", "127.0.0.1:1", true, t0);
        assert!(peer.check_timeout(Duration::from_secs(1), t0 + Duration::from_secs(2)));
        assert_eq!(peer.status, PeerStatus::Offline);
    }

    #[tokio::test]
    async fn test_detect_failures_fires_once_per_period() {
        let (detector, events) = detector();
        let mut rx = events.subscribe();
        let t0 = Instant::now();

        detector.register_peer("a", "127.0.0.1:1", true).await;
        detector.register_peer("b", "127.0.0.1:2", true).await;
        detector.record_heartbeat_at("a", t0).await;
        detector.record_heartbeat_at("b", t0).await;

        let later = t0 + Duration::from_secs(20);
        detector.record_heartbeat_at("b", later).await;

        let down = detector.detect_failures_at(Some("a"), later).await;
        assert_eq!(down, vec!["a".to_string()]);
        let again = detector.detect_failures_at(Some("a"), later + Duration::from_secs(5)).await;
        assert!(again.is_empty());

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            vec![
                ClusterEvent::NodeUp("a".into()),
                ClusterEvent::NodeUp("b".into()),
                ClusterEvent::NodeDown("a".into()),
                ClusterEvent::MasterDown("a".into()),
            ]
        );
        assert_eq!(detector.offline_peers().await, vec!["a".to_string()]);
        assert_eq!(detector.online_peers().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (detector, _events) = detector();
        assert!(detector.register_peer("a", "127.0.0.1:1", true).await);
        assert!(!detector.register_peer("a", "127.0.0.1:9", false).await);
        let peer = detector.peer("a").await.unwrap();
        assert_eq!(peer.address, "127.0.0.1:9");
        assert!(!peer.can_be_master);
        assert_eq!(peer.status, PeerStatus::Unknown);
    }
}
