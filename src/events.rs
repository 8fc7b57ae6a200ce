//! Typed cluster events.
//!
//! The failure detector and the election publish here; the election monitor
//! and replication recovery subscribe. Publishers do not know who listens.

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A peer transitioned into OFFLINE.
    NodeDown(String),
    /// A peer transitioned into ONLINE.
    NodeUp(String),
    /// The peer currently recognised as master transitioned into OFFLINE.
    MasterDown(String),
    LeaderChanged { leader: String, term: u64 },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
