//! Ricart–Agrawala mutual exclusion over named resources.
//!
//! A request is `(lamport_timestamp, node_id)`; lower tuples win. A node
//! answers a competing request immediately unless it holds the resource or
//! its own pending request has priority, in which case the reply is deferred
//! until it releases.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::clock::LamportClock;
use crate::config::MutexConfig;
use crate::detector::PeerEntry;
use crate::rpc::{Header, MutexReply, MutexRequest, PeerMessage};
use crate::transport::ClusterTransport;
use crate::CoreError;

/// A reply owed to a peer whose request was deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredReply {
    pub node_id: String,
    pub address: String,
    pub request_timestamp: u64,
}

#[derive(Debug)]
enum Slot {
    Requesting {
        timestamp: u64,
        replies: HashSet<String>,
        needed: usize,
    },
    Held {
        timestamp: u64,
    },
}

impl Slot {
    fn timestamp(&self) -> u64 {
        match self {
            Slot::Requesting { timestamp, .. } | Slot::Held { timestamp } => *timestamp,
        }
    }
}

/// Per-node request/defer bookkeeping, free of I/O.
#[derive(Debug)]
pub struct MutexState {
    self_id: String,
    own: HashMap<String, Slot>,
    deferred: HashMap<String, Vec<DeferredReply>>,
}

impl MutexState {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            own: HashMap::new(),
            deferred: HashMap::new(),
        }
    }

    /// Whether this node holds or is requesting `resource_id`.
    pub fn is_active(&self, resource_id: &str) -> bool {
        self.own.contains_key(resource_id)
    }

    pub fn holds(&self, resource_id: &str) -> bool {
        matches!(self.own.get(resource_id), Some(Slot::Held { .. }))
    }

    /// Register an own request. Returns true if it is granted outright
    /// because no replies are needed.
    pub fn begin_request(&mut self, resource_id: &str, timestamp: u64, needed: usize) -> bool {
        let slot = if needed == 0 {
            Slot::Held { timestamp }
        } else {
            Slot::Requesting {
                timestamp,
                replies: HashSet::new(),
                needed,
            }
        };
        self.own.insert(resource_id.to_string(), slot);
        needed == 0
    }

    /// Decide on an incoming request. Returns true to reply now; otherwise
    /// the reply is queued until [`Self::release`].
    pub fn on_request(&mut self, resource_id: &str, from: DeferredReply) -> bool {
        let defer = match self.own.get(resource_id) {
            None => false,
            Some(Slot::Held { .. }) => true,
            Some(slot @ Slot::Requesting { .. }) => {
                (slot.timestamp(), self.self_id.as_str())
                    < (from.request_timestamp, from.node_id.as_str())
            }
        };
        if defer {
            self.deferred
                .entry(resource_id.to_string())
                .or_default()
                .push(from);
        }
        !defer
    }

    /// Count a reply to the own request stamped `request_timestamp`. Returns
    /// true when this reply completes the set and the resource is entered.
    pub fn on_reply(&mut self, resource_id: &str, from: &str, request_timestamp: u64) -> bool {
        let Some(Slot::Requesting {
            timestamp,
            replies,
            needed,
        }) = self.own.get_mut(resource_id)
        else {
            return false;
        };
        // Late reply to a withdrawn request
        if *timestamp != request_timestamp {
            return false;
        }
        replies.insert(from.to_string());
        if replies.len() < *needed {
            return false;
        }
        let timestamp = *timestamp;
        self.own
            .insert(resource_id.to_string(), Slot::Held { timestamp });
        true
    }

    /// Leave the critical section (or withdraw a pending request) and hand
    /// back every reply deferred for the resource.
    pub fn release(&mut self, resource_id: &str) -> (bool, Vec<DeferredReply>) {
        let was_active = self.own.remove(resource_id).is_some();
        let deferred = self.deferred.remove(resource_id).unwrap_or_default();
        (was_active, deferred)
    }
}

struct Inner {
    state: MutexState,
    waiters: HashMap<String, oneshot::Sender<()>>,
}

/// Distributed mutex component.
pub struct DistributedMutex {
    self_id: String,
    clock: LamportClock,
    inner: Mutex<Inner>,
    transport: Arc<ClusterTransport>,
    acquire_timeout: Duration,
    quorum: Option<usize>,
}

impl DistributedMutex {
    pub fn new(self_id: &str, config: &MutexConfig, transport: Arc<ClusterTransport>) -> Self {
        Self {
            self_id: self_id.to_string(),
            clock: LamportClock::new(),
            inner: Mutex::new(Inner {
                state: MutexState::new(self_id),
                waiters: HashMap::new(),
            }),
            transport,
            acquire_timeout: config.acquire_timeout,
            quorum: config.quorum,
        }
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub async fn holds(&self, resource_id: &str) -> bool {
        self.inner.lock().await.state.holds(resource_id)
    }

    /// Enter the critical section for `resource_id`, asking every peer in
    /// `peers`. Fails with `LockTimeout` if the replies do not arrive in time,
    /// in which case nothing is held.
    pub async fn acquire(&self, resource_id: &str, peers: &[PeerEntry]) -> Result<(), CoreError> {
        let needed = self
            .quorum
            .map_or(peers.len(), |quorum| quorum.min(peers.len()));

        let (timestamp, granted) = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_active(resource_id) {
                return Err(CoreError::LockBusy(resource_id.to_string()));
            }
            let timestamp = self.clock.increment();
            if inner.state.begin_request(resource_id, timestamp, needed) {
                info!(resource = %resource_id, timestamp, "Lock acquired (no peers to ask)");
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(resource_id.to_string(), tx);
            (timestamp, rx)
        };
        debug!(resource = %resource_id, timestamp, needed, "Requesting lock");

        let exchange = async {
            self.request_replies(resource_id, timestamp, peers).await;
            granted.await
        };

        match tokio::time::timeout(self.acquire_timeout, exchange).await {
            Ok(Ok(())) => {
                info!(resource = %resource_id, timestamp, "Lock acquired");
                Ok(())
            }
            _ => {
                warn!(resource = %resource_id, timestamp, "Lock acquire timed out, withdrawing");
                self.flush(resource_id).await;
                Err(CoreError::LockTimeout(resource_id.to_string()))
            }
        }
    }

    /// Leave the critical section and send every deferred reply. Returns
    /// whether the resource was held or requested.
    pub async fn release(&self, resource_id: &str) -> bool {
        let released = self.flush(resource_id).await;
        if released {
            info!(resource = %resource_id, "Lock released");
        }
        released
    }

    /// Handle an inbound request. Answers `MUTEX_REPLY` when granted now,
    /// `ACK` when the reply is deferred.
    pub async fn handle_request(&self, request: &MutexRequest, sender_address: &str) -> PeerMessage {
        let request_timestamp = request.header.timestamp;
        self.clock.update(request_timestamp);

        let from = DeferredReply {
            node_id: request.header.sender_id.clone(),
            address: sender_address.to_string(),
            request_timestamp,
        };
        let reply_now = self
            .inner
            .lock()
            .await
            .state
            .on_request(&request.resource_id, from);

        if reply_now {
            self.reply(&request.resource_id, request_timestamp)
        } else {
            debug!(
                resource = %request.resource_id,
                requester = %request.header.sender_id,
                "Deferring lock reply"
            );
            PeerMessage::ack(&self.self_id, false)
        }
    }

    /// Handle a deferred reply delivered as its own message.
    pub async fn handle_reply(&self, reply: &MutexReply) -> PeerMessage {
        self.clock.update(reply.header.timestamp);
        self.record_reply(
            &reply.resource_id,
            &reply.header.sender_id,
            reply.request_timestamp,
        )
        .await;
        PeerMessage::ack(&self.self_id, true)
    }

    async fn request_replies(&self, resource_id: &str, timestamp: u64, peers: &[PeerEntry]) {
        let requests = peers.iter().map(|peer| {
            let message = PeerMessage::MutexRequest(MutexRequest {
                header: Header::lamport(&self.self_id, timestamp),
                resource_id: resource_id.to_string(),
            });
            async move { (peer, self.transport.send(&peer.address, message).await) }
        });

        for (peer, response) in join_all(requests).await {
            match response {
                Ok(PeerMessage::MutexReply(reply)) => {
                    self.clock.update(reply.header.timestamp);
                    self.record_reply(resource_id, &peer.node_id, reply.request_timestamp)
                        .await;
                }
                Ok(PeerMessage::Ack(_)) => {
                    debug!(peer = %peer.node_id, resource = %resource_id, "Reply deferred by peer");
                }
                Ok(other) => {
                    warn!(peer = %peer.node_id, "Unexpected mutex response: {other:?}");
                }
                Err(e) => {
                    debug!(peer = %peer.node_id, error = %e, "Failed to send lock request");
                }
            }
        }
    }

    async fn record_reply(&self, resource_id: &str, from: &str, request_timestamp: u64) {
        let mut inner = self.inner.lock().await;
        if inner.state.on_reply(resource_id, from, request_timestamp) {
            if let Some(tx) = inner.waiters.remove(resource_id) {
                let _ = tx.send(());
            }
        }
    }

    async fn flush(&self, resource_id: &str) -> bool {
        let (was_active, deferred) = {
            let mut inner = self.inner.lock().await;
            inner.waiters.remove(resource_id);
            inner.state.release(resource_id)
        };

        for owed in deferred {
            let message = self.reply(resource_id, owed.request_timestamp);
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(e) = transport.send(&owed.address, message).await {
                    warn!(peer = %owed.node_id, error = %e, "Failed to send deferred lock reply");
                }
            });
        }
        was_active
    }

    fn reply(&self, resource_id: &str, request_timestamp: u64) -> PeerMessage {
        PeerMessage::MutexReply(MutexReply {
            header: Header::lamport(&self.self_id, self.clock.increment()),
            resource_id: resource_id.to_string(),
            request_timestamp,
        })
    }
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("self_id", &self.self_id)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("quorum", &self.quorum)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester(node_id: &str, ts: u64) -> DeferredReply {
        DeferredReply {
            node_id: node_id.to_string(),
            address: format!("{node_id}:1"),
            request_timestamp: ts,
        }
    }

    #[test]
    fn test_idle_node_replies_immediately() {
        let mut state = MutexState::new("a");
        assert!(state.on_request("r", requester("b", 5)));
        let (active, deferred) = state.release("r");
        assert!(!active);
        assert!(deferred.is_empty());
    }

    #[test]
    fn test_lower_tuple_wins() {
        // a requests at 3, b at 5: a has priority, b's request is deferred.
        let mut a = MutexState::new("a");
        a.begin_request("r", 3, 1);
        assert!(!a.on_request("r", requester("b", 5)));

        // b sees a's lower timestamp and replies immediately.
        let mut b = MutexState::new("b");
        b.begin_request("r", 5, 1);
        assert!(b.on_request("r", requester("a", 3)));
    }

    #[test]
    fn test_equal_timestamps_break_on_node_id() {
        let mut a = MutexState::new("a");
        a.begin_request("r", 4, 1);
        assert!(!a.on_request("r", requester("b", 4)));

        let mut b = MutexState::new("b");
        b.begin_request("r", 4, 1);
        assert!(b.on_request("r", requester("a", 4)));
    }

    #[test]
    fn test_holder_defers_until_release() {
        let mut state = MutexState::new("b");
        state.begin_request("r", 9, 1);
        assert!(state.on_reply("r", "a", 9));
        assert!(state.holds("r"));

        // Even a lower timestamp waits while the resource is held.
        assert!(!state.on_request("r", requester("a", 1)));
        // Other resources are unaffected.
        assert!(state.on_request("other", requester("a", 1)));

        let (active, deferred) = state.release("r");
        assert!(active);
        assert_eq!(deferred, vec![requester("a", 1)]);
        assert!(!state.is_active("r"));
    }

    #[test]
    fn test_reply_to_withdrawn_request_is_ignored() {
        let mut state = MutexState::new("a");
        state.begin_request("r", 2, 1);
        state.release("r");
        state.begin_request("r", 7, 1);

        assert!(!state.on_reply("r", "b", 2));
        assert!(!state.holds("r"));
        assert!(state.on_reply("r", "b", 7));
    }

    #[test]
    fn test_needs_every_reply() {
        let mut state = MutexState::new("a");
        state.begin_request("r", 1, 2);
        assert!(!state.on_reply("r", "b", 1));
        // Duplicate replies do not count twice.
        assert!(!state.on_reply("r", "b", 1));
        assert!(state.on_reply("r", "c", 1));
    }

    #[tokio::test]
    async fn test_acquire_without_peers_and_busy() {
        let mutex = DistributedMutex::new(
            "a",
            &MutexConfig::default(),
            ClusterTransport::new(Duration::from_millis(100)),
        );
        mutex.acquire("r", &[]).await.unwrap();
        assert!(mutex.holds("r").await);
        assert!(matches!(
            mutex.acquire("r", &[]).await,
            Err(CoreError::LockBusy(_))
        ));
        assert!(mutex.release("r").await);
        assert!(!mutex.release("r").await);
    }
}
