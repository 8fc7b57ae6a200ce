//! Leader election with a pluggable tie-break strategy.
//!
//! Both strategies share the same term rules: terms only move forward, a
//! node that becomes coordinator always does so at a fresh term, and a
//! `COORDINATOR` announcement older than the local term is never accepted.
//! Two announcements for the same term are ordered by leader id, which is
//! what makes a double proof-of-work claim converge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ElectionConfig, ElectionMode};
use crate::content::ContentTransport;
use crate::detector::PeerEntry;
use crate::events::{ClusterEvent, EventBus};
use crate::pow;
use crate::rpc::{Alive, Claim, Coordinator, Election, Header, PeerMessage, Puzzle};
use crate::storage::Storage;
use crate::transport::ClusterTransport;
use crate::{CoordinatorNode, CoreError};

// ============================================================================
// Strategy
// ============================================================================

/// Tie-break strategy, fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionStrategy {
    /// Highest master-eligible node id wins.
    Bully,
    /// First valid puzzle claim a node accepts for a term wins.
    ProofOfWork { difficulty: u32 },
}

impl ElectionStrategy {
    pub fn from_config(config: &ElectionConfig) -> Self {
        match config.mode {
            ElectionMode::Bully => ElectionStrategy::Bully,
            ElectionMode::ProofOfWork => ElectionStrategy::ProofOfWork {
                difficulty: config.pow_difficulty.min(pow::MAX_DIFFICULTY),
            },
        }
    }
}

// ============================================================================
// ElectionState — pure state transitions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    ElectionInProgress,
    WaitingCoordinator,
    IsCoordinator,
}

/// Read-only view of the election state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationStatus {
    pub phase: Phase,
    pub current_master: Option<String>,
    pub term: u64,
}

impl CoordinationStatus {
    fn is_resolved(&self, min_term: u64) -> bool {
        matches!(self.phase, Phase::Idle | Phase::IsCoordinator)
            && self.current_master.is_some()
            && self.term >= min_term
    }
}

/// Result of a completed election round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome {
    pub leader: String,
    pub term: u64,
}

/// Election facts that survive a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedElection {
    pub term: u64,
    pub current_master: Option<String>,
}

/// What a round deadline expiry asks the caller to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    Pending,
    Retry,
    BecameCoordinator(u64),
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct ElectionState {
    pub self_id: String,
    pub current_master: Option<String>,
    pub term: u64,
    pub phase: Phase,
    /// Term at which `current_master` was accepted.
    master_term: u64,
    deadline: Option<Instant>,
    alive_received: bool,
    accepted_claim: Option<(u64, String)>,
    solving_term: Option<u64>,
    /// Puzzles issued or received for the current term, as `(term, challenge)`.
    puzzles: Vec<(u64, String)>,
}

impl ElectionState {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            current_master: None,
            term: 0,
            phase: Phase::Idle,
            master_term: 0,
            deadline: None,
            alive_received: false,
            accepted_claim: None,
            solving_term: None,
            puzzles: Vec::new(),
        }
    }

    /// Rebuild from persisted state. A node never comes back up believing it
    /// is still coordinator.
    pub fn restore(self_id: impl Into<String>, persisted: PersistedElection) -> Self {
        let mut state = Self::new(self_id);
        state.term = persisted.term;
        state.master_term = persisted.term;
        state.current_master = persisted.current_master.filter(|m| *m != state.self_id);
        state
    }

    pub fn status(&self) -> CoordinationStatus {
        CoordinationStatus {
            phase: self.phase,
            current_master: self.current_master.clone(),
            term: self.term,
        }
    }

    pub fn persisted(&self) -> PersistedElection {
        PersistedElection {
            term: self.term,
            current_master: self.current_master.clone(),
        }
    }

    pub fn observe_term(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
        }
    }

    pub fn set_initial_master(&mut self, master: &str) {
        self.current_master = Some(master.to_string());
        self.master_term = self.term;
        self.phase = if master == self.self_id {
            Phase::IsCoordinator
        } else {
            Phase::Idle
        };
        self.deadline = None;
    }

    /// Start a Bully round. A retried round moves to a fresh term.
    pub fn begin_round(&mut self, retry: bool) {
        if retry {
            self.term += 1;
        }
        self.phase = Phase::ElectionInProgress;
        self.alive_received = false;
        self.deadline = None;
    }

    pub fn await_coordinator(&mut self, deadline: Instant) {
        self.phase = Phase::WaitingCoordinator;
        self.deadline = Some(deadline);
    }

    pub fn abandon_round(&mut self) {
        self.phase = Phase::Idle;
        self.deadline = None;
    }

    /// Take leadership at a fresh term. Returns that term.
    pub fn become_coordinator(&mut self) -> u64 {
        self.term += 1;
        self.master_term = self.term;
        self.current_master = Some(self.self_id.clone());
        self.phase = Phase::IsCoordinator;
        self.deadline = None;
        self.term
    }

    /// Re-assert leadership at a term above every candidate seen so far.
    /// Returns the term to announce, or None if this node is not coordinator.
    pub fn reassert(&mut self) -> Option<u64> {
        if self.phase != Phase::IsCoordinator {
            return None;
        }
        self.term += 1;
        self.master_term = self.term;
        Some(self.term)
    }

    /// ALIVE from a higher-priority peer: keep waiting for its COORDINATOR.
    pub fn on_alive(&mut self, term: u64, deadline: Instant) {
        self.observe_term(term);
        if matches!(
            self.phase,
            Phase::ElectionInProgress | Phase::WaitingCoordinator
        ) {
            self.alive_received = true;
            self.phase = Phase::WaitingCoordinator;
            self.deadline = Some(deadline);
        }
    }

    /// Apply a COORDINATOR announcement. Returns whether it was accepted.
    pub fn on_coordinator(&mut self, leader: &str, term: u64) -> bool {
        if term < self.term {
            return false;
        }
        if term == self.term && self.master_term == term {
            if let Some(current) = &self.current_master {
                if current != leader && leader < current.as_str() {
                    return false;
                }
            }
        }
        self.install_master(leader, term);
        self.accepted_claim = Some((term, leader.to_string()));
        true
    }

    /// Start a proof-of-work round at a fresh term with `challenge`. Returns
    /// that term.
    pub fn begin_puzzle(&mut self, challenge: &str, deadline: Instant, will_solve: bool) -> u64 {
        self.term += 1;
        self.phase = Phase::ElectionInProgress;
        self.alive_received = false;
        self.deadline = Some(deadline);
        self.solving_term = will_solve.then_some(self.term);
        self.record_puzzle(self.term, challenge);
        self.term
    }

    /// Apply a PUZZLE. Returns true if this node should start solving it.
    pub fn on_puzzle(&mut self, term: u64, challenge: &str, deadline: Instant, can_solve: bool) -> bool {
        if term < self.term || self.claim_settled(term) {
            return false;
        }
        self.term = term;
        self.phase = Phase::ElectionInProgress;
        self.deadline = Some(deadline);
        self.record_puzzle(term, challenge);
        if !can_solve || self.solving_term == Some(term) {
            return false;
        }
        self.solving_term = Some(term);
        true
    }

    /// Accept `claimant` as winner of `term` unless a different claim was
    /// already accepted for it. The claim must answer a puzzle this node
    /// issued or received for that term.
    pub fn accept_claim(&mut self, term: u64, claimant: &str, challenge: &str) -> bool {
        if term < self.term || !self.knows_puzzle(term, challenge) {
            return false;
        }
        if let Some((t, c)) = &self.accepted_claim {
            if *t == term && c != claimant {
                return false;
            }
        }
        self.accepted_claim = Some((term, claimant.to_string()));
        self.install_master(claimant, term);
        true
    }

    /// Resolve an expired round deadline.
    pub fn expire(&mut self, now: Instant, strategy: ElectionStrategy, eligible: bool) -> Expiry {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Expiry::Pending,
        }
        self.deadline = None;
        match strategy {
            ElectionStrategy::ProofOfWork { .. } => Expiry::Retry,
            ElectionStrategy::Bully if self.alive_received => Expiry::Retry,
            ElectionStrategy::Bully if eligible => Expiry::BecameCoordinator(self.become_coordinator()),
            ElectionStrategy::Bully => {
                self.abandon_round();
                Expiry::Abandoned
            }
        }
    }

    /// Idle with nobody in charge.
    pub fn needs_round(&self) -> bool {
        self.phase == Phase::Idle && self.current_master.is_none()
    }

    fn record_puzzle(&mut self, term: u64, challenge: &str) {
        self.puzzles.retain(|(t, _)| *t >= term);
        if !self.knows_puzzle(term, challenge) {
            self.puzzles.push((term, challenge.to_string()));
        }
    }

    fn knows_puzzle(&self, term: u64, challenge: &str) -> bool {
        self.puzzles.iter().any(|(t, c)| *t == term && c == challenge)
    }

    fn claim_settled(&self, term: u64) -> bool {
        matches!(&self.accepted_claim, Some((t, _)) if *t == term)
    }

    fn install_master(&mut self, leader: &str, term: u64) {
        self.term = term;
        self.master_term = term;
        self.current_master = Some(leader.to_string());
        self.phase = if leader == self.self_id {
            Phase::IsCoordinator
        } else {
            Phase::Idle
        };
        self.deadline = None;
        self.alive_received = false;
    }
}

// ============================================================================
// LeaderElection component
// ============================================================================

enum RoundStart {
    Coordinator(u64),
    Waiting(u64),
    Abandoned,
}

/// Election component. Owns the [`ElectionState`]; callers hand it
/// membership snapshots and inbound messages.
pub struct LeaderElection {
    self_id: String,
    can_be_master: bool,
    strategy: ElectionStrategy,
    timeout: Duration,
    state: RwLock<ElectionState>,
    status_tx: watch::Sender<CoordinationStatus>,
    transport: Arc<ClusterTransport>,
    events: EventBus,
}

impl LeaderElection {
    pub fn new(
        state: ElectionState,
        can_be_master: bool,
        config: &ElectionConfig,
        transport: Arc<ClusterTransport>,
        events: EventBus,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(state.status());
        Arc::new(Self {
            self_id: state.self_id.clone(),
            can_be_master,
            strategy: ElectionStrategy::from_config(config),
            timeout: config.timeout,
            state: RwLock::new(state),
            status_tx,
            transport,
            events,
        })
    }

    pub fn strategy(&self) -> ElectionStrategy {
        self.strategy
    }

    pub fn status(&self) -> CoordinationStatus {
        self.status_tx.borrow().clone()
    }

    pub async fn current_master(&self) -> Option<String> {
        self.state.read().await.current_master.clone()
    }

    pub async fn is_coordinator(&self) -> bool {
        self.state.read().await.phase == Phase::IsCoordinator
    }

    pub async fn term(&self) -> u64 {
        self.state.read().await.term
    }

    pub async fn persisted(&self) -> PersistedElection {
        self.state.read().await.persisted()
    }

    pub async fn needs_round(&self) -> bool {
        self.state.read().await.needs_round()
    }

    /// Seed the master without running an election.
    pub async fn set_initial_master(&self, master: &str) {
        info!(master = %master, "Seeding initial master");
        self.update(|s| s.set_initial_master(master)).await;
    }

    /// Kick off a fresh round against the given membership snapshot. The
    /// round runs in the background; see [`Self::wait_for_outcome`].
    pub fn start(self: &Arc<Self>, reason: &'static str, peers: Vec<PeerEntry>) -> JoinHandle<()> {
        let election = Arc::clone(self);
        tokio::spawn(async move {
            election.run_round(reason, peers, false).await;
        })
    }

    /// Wait until a leader at `min_term` or later is known.
    pub async fn wait_for_outcome(
        &self,
        min_term: u64,
        timeout: Duration,
    ) -> Result<ElectionOutcome, CoreError> {
        let mut rx = self.status_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            let status = rx
                .wait_for(|s| s.is_resolved(min_term))
                .await
                .map_err(|_| CoreError::ElectionTimeout)?;
            status
                .current_master
                .clone()
                .map(|leader| ElectionOutcome {
                    leader,
                    term: status.term,
                })
                .ok_or(CoreError::ElectionTimeout)
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(CoreError::ElectionTimeout),
        }
    }

    /// Called periodically; retries or resolves a round whose deadline passed.
    pub async fn check_deadline(self: &Arc<Self>, peers: Vec<PeerEntry>) {
        let now = Instant::now();
        let (strategy, eligible) = (self.strategy, self.can_be_master);
        let expiry = self.update(|s| s.expire(now, strategy, eligible)).await;

        match expiry {
            Expiry::Pending => {}
            Expiry::Retry => {
                info!("Election round timed out, retrying");
                let election = Arc::clone(self);
                tokio::spawn(async move {
                    election.run_round("round timed out", peers, true).await;
                });
            }
            Expiry::BecameCoordinator(term) => {
                info!(term, "No higher-priority peer answered, becoming coordinator");
                let election = Arc::clone(self);
                tokio::spawn(async move {
                    election.announce(&peers, term).await;
                });
            }
            Expiry::Abandoned => {
                warn!("No master-eligible peer answered the election");
            }
        }
    }

    // -- Inbound messages --

    pub async fn handle_election(
        self: &Arc<Self>,
        sender: &str,
        term: u64,
        peers: Vec<PeerEntry>,
    ) -> PeerMessage {
        if self.strategy != ElectionStrategy::Bully || !self.can_be_master {
            return PeerMessage::ack(&self.self_id, false);
        }

        let (reply_term, reassert, cascade) = self
            .update(|s| {
                s.observe_term(term);
                let reassert = s.reassert();
                let cascade = s.phase == Phase::Idle;
                (s.term, reassert, cascade)
            })
            .await;
        debug!(candidate = %sender, term, "ELECTION received, replying ALIVE");

        if let Some(term) = reassert {
            let election = Arc::clone(self);
            tokio::spawn(async move {
                election.announce(&peers, term).await;
            });
        } else if cascade {
            let election = Arc::clone(self);
            tokio::spawn(async move {
                election.run_round("election from lower peer", peers, false).await;
            });
        }

        PeerMessage::Alive(Alive {
            header: Header::now(&self.self_id),
            term: reply_term,
        })
    }

    /// Apply a COORDINATOR announcement. A stale one is answered with this
    /// node's own view so the announcer can step down.
    pub async fn handle_coordinator(
        self: &Arc<Self>,
        leader: &str,
        term: u64,
        peers: Vec<PeerEntry>,
    ) -> PeerMessage {
        let (accepted, status) = self
            .update(|s| (s.on_coordinator(leader, term), s.status()))
            .await;

        if !accepted {
            debug!(leader = %leader, term, local_term = status.term, "Rejected COORDINATOR");
            return match status.current_master {
                Some(master) if status.term > term => PeerMessage::Coordinator(Coordinator {
                    header: Header::now(&self.self_id),
                    leader_id: master,
                    term: status.term,
                }),
                _ => PeerMessage::ack(&self.self_id, false),
            };
        }

        if self.strategy == ElectionStrategy::Bully
            && self.can_be_master
            && leader < self.self_id.as_str()
        {
            info!(leader = %leader, "Lower-priority coordinator announced, challenging");
            let election = Arc::clone(self);
            tokio::spawn(async move {
                election.run_round("lower-priority coordinator", peers, false).await;
            });
        }

        PeerMessage::ack(&self.self_id, true)
    }

    pub async fn handle_puzzle(
        self: &Arc<Self>,
        puzzle: Puzzle,
        peers: Vec<PeerEntry>,
    ) -> PeerMessage {
        let ElectionStrategy::ProofOfWork { difficulty } = self.strategy else {
            return PeerMessage::ack(&self.self_id, false);
        };
        if puzzle.difficulty > pow::MAX_DIFFICULTY {
            warn!(
                sender = %puzzle.header.sender_id,
                difficulty = puzzle.difficulty,
                "Puzzle difficulty above the maximum, ignoring"
            );
            return PeerMessage::ack(&self.self_id, false);
        }

        let deadline = Instant::now() + self.timeout;
        let eligible = self.can_be_master;
        let solve = self
            .update(|s| s.on_puzzle(puzzle.term, &puzzle.challenge, deadline, eligible))
            .await;

        if solve {
            let election = Arc::clone(self);
            let difficulty = puzzle.difficulty.max(difficulty);
            tokio::spawn(async move {
                election
                    .solve_and_claim(puzzle.term, puzzle.challenge, difficulty, peers)
                    .await;
            });
        }
        PeerMessage::ack(&self.self_id, true)
    }

    pub async fn handle_claim(&self, claim: &Claim) -> PeerMessage {
        let ElectionStrategy::ProofOfWork { difficulty } = self.strategy else {
            return PeerMessage::ack(&self.self_id, false);
        };

        let claimant = claim.header.sender_id.as_str();
        if claim.difficulty < difficulty
            || !pow::verify(&claim.challenge, claimant, claim.nonce, claim.difficulty)
        {
            warn!(claimant = %claimant, term = claim.term, "Invalid puzzle claim");
            return PeerMessage::ack(&self.self_id, false);
        }

        let accepted = self
            .update(|s| s.accept_claim(claim.term, claimant, &claim.challenge))
            .await;
        debug!(claimant = %claimant, term = claim.term, accepted, "Puzzle claim");
        PeerMessage::ack(&self.self_id, accepted)
    }

    // -- Rounds --

    async fn run_round(self: &Arc<Self>, reason: &str, peers: Vec<PeerEntry>, retry: bool) {
        match self.strategy {
            ElectionStrategy::Bully => self.run_bully_round(reason, peers, retry).await,
            ElectionStrategy::ProofOfWork { difficulty } => {
                self.run_puzzle_round(reason, peers, difficulty).await
            }
        }
    }

    async fn run_bully_round(self: &Arc<Self>, reason: &str, peers: Vec<PeerEntry>, retry: bool) {
        // An ineligible node can only wake up the eligible ones.
        let higher: Vec<PeerEntry> = peers
            .iter()
            .filter(|p| p.can_be_master && (!self.can_be_master || p.node_id > self.self_id))
            .cloned()
            .collect();
        let eligible = self.can_be_master;
        let deadline = Instant::now() + self.timeout;

        let start = self
            .update(|s| {
                s.begin_round(retry);
                if !higher.is_empty() {
                    s.await_coordinator(deadline);
                    RoundStart::Waiting(s.term)
                } else if eligible {
                    RoundStart::Coordinator(s.become_coordinator())
                } else {
                    s.abandon_round();
                    RoundStart::Abandoned
                }
            })
            .await;

        match start {
            RoundStart::Coordinator(term) => {
                info!(reason = %reason, term, "No higher-priority peer, becoming coordinator");
                self.announce(&peers, term).await;
            }
            RoundStart::Waiting(term) => {
                info!(reason = %reason, term, candidates = higher.len(), "Election started");
                self.send_election(&higher, term).await;
            }
            RoundStart::Abandoned => {
                debug!(reason = %reason, "No master-eligible peer known, cannot elect");
            }
        }
    }

    async fn send_election(&self, higher: &[PeerEntry], term: u64) {
        let requests = higher.iter().map(|peer| {
            let message = PeerMessage::Election(Election {
                header: Header::now(&self.self_id),
                term,
            });
            async move { (peer, self.transport.send(&peer.address, message).await) }
        });

        for (peer, response) in join_all(requests).await {
            match response {
                Ok(PeerMessage::Alive(alive)) => {
                    debug!(peer = %peer.node_id, term = alive.term, "ALIVE received");
                    let deadline = Instant::now() + self.timeout;
                    self.update(|s| s.on_alive(alive.term, deadline)).await;
                }
                Ok(PeerMessage::Ack(_)) => {
                    debug!(peer = %peer.node_id, "Peer declined the election");
                }
                Ok(other) => {
                    warn!(peer = %peer.node_id, "Unexpected election response: {other:?}");
                }
                Err(e) => {
                    debug!(peer = %peer.node_id, error = %e, "Failed to send ELECTION");
                }
            }
        }
    }

    async fn run_puzzle_round(self: &Arc<Self>, reason: &str, peers: Vec<PeerEntry>, difficulty: u32) {
        let challenge = pow::new_challenge();
        let deadline = Instant::now() + self.timeout;
        let eligible = self.can_be_master;
        let term = self
            .update(|s| s.begin_puzzle(&challenge, deadline, eligible))
            .await;
        info!(reason = %reason, term, difficulty, "Proof-of-work round started");

        if eligible {
            let election = Arc::clone(self);
            let (challenge, peers) = (challenge.clone(), peers.clone());
            tokio::spawn(async move {
                election
                    .solve_and_claim(term, challenge, difficulty, peers)
                    .await;
            });
        }

        let puzzle = PeerMessage::Puzzle(Puzzle {
            header: Header::now(&self.self_id),
            term,
            challenge,
            difficulty,
        });
        self.broadcast(&peers, puzzle).await;
    }

    async fn solve_and_claim(
        self: Arc<Self>,
        term: u64,
        challenge: String,
        difficulty: u32,
        peers: Vec<PeerEntry>,
    ) {
        let (c, id) = (challenge.clone(), self.self_id.clone());
        let deadline = Instant::now() + self.timeout;
        let solved =
            tokio::task::spawn_blocking(move || pow::solve(&c, &id, difficulty, deadline)).await;
        let nonce = match solved {
            Ok(Some(nonce)) => nonce,
            Ok(None) => {
                debug!(term, difficulty, "Puzzle not solved before the round deadline");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Puzzle solver failed");
                return;
            }
        };

        let id = self.self_id.clone();
        let won = self
            .update(|s| s.accept_claim(term, &id, &challenge))
            .await;
        if !won {
            debug!(term, "Puzzle solved too late, another claim won");
            return;
        }
        info!(term, nonce, "Puzzle solved, claiming leadership");

        let claim = PeerMessage::Claim(Claim {
            header: Header::now(&self.self_id),
            term,
            challenge,
            difficulty,
            nonce,
        });
        self.broadcast(&peers, claim).await;
        self.announce(&peers, term).await;
    }

    /// Broadcast COORDINATOR for `term`. A peer that knows a newer leader
    /// answers with its own COORDINATOR, which is applied here.
    async fn announce(self: &Arc<Self>, peers: &[PeerEntry], term: u64) {
        let message = PeerMessage::Coordinator(Coordinator {
            header: Header::now(&self.self_id),
            leader_id: self.self_id.clone(),
            term,
        });

        for (peer, response) in self.broadcast(peers, message).await {
            if let Ok(PeerMessage::Coordinator(newer)) = response {
                info!(peer = %peer, leader = %newer.leader_id, term = newer.term, "Peer knows a newer coordinator");
                self.update(|s| s.on_coordinator(&newer.leader_id, newer.term))
                    .await;
            }
        }
    }

    async fn broadcast(
        &self,
        peers: &[PeerEntry],
        message: PeerMessage,
    ) -> Vec<(String, Result<PeerMessage, crate::transport::TransportError>)> {
        let requests = peers.iter().map(|peer| {
            let message = message.clone();
            async move {
                let response = self.transport.send(&peer.address, message).await;
                if let Err(e) = &response {
                    debug!(peer = %peer.node_id, error = %e, "Election broadcast failed");
                }
                (peer.node_id.clone(), response)
            }
        });
        join_all(requests).await
    }

    /// Apply `f` to the state, then publish the new status and, if the
    /// leader changed, a `LeaderChanged` event.
    async fn update<R>(&self, f: impl FnOnce(&mut ElectionState) -> R) -> R {
        let mut state = self.state.write().await;
        let before = (state.current_master.clone(), state.master_term);
        let result = f(&mut state);
        let status = state.status();
        let changed = (state.current_master.clone(), state.master_term) != before;
        let master_term = state.master_term;
        drop(state);

        if changed {
            if let Some(leader) = status.current_master.clone() {
                info!(leader = %leader, term = master_term, "Leader changed");
                self.events.publish(ClusterEvent::LeaderChanged {
                    leader,
                    term: master_term,
                });
            }
        }
        self.status_tx.send_replace(status);
        result
    }
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("self_id", &self.self_id)
            .field("strategy", &self.strategy)
            .finish()
    }
}

// ============================================================================
// Monitor task
// ============================================================================

pub(crate) fn start_election_monitor<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
) -> JoinHandle<()> {
    let check_interval = (node.config.election.timeout / 5).max(Duration::from_millis(20));
    let mut events = node.events.subscribe();

    tokio::spawn(async move {
        if node.config.initial_master.is_none() {
            // Stagger startup rounds across nodes
            let startup_delay = Duration::from_millis(rand::random::<u64>() % 350 + 150);
            debug!("Election monitor starting in {}ms", startup_delay.as_millis());
            tokio::select! {
                _ = node.shutdown.cancelled() => return,
                _ = tokio::time::sleep(startup_delay) => {}
            }
            let peers = node.detector.reachable_entries().await;
            node.election.start("startup", peers);
        }

        let mut interval = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = node.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let peers = node.detector.reachable_entries().await;
                    if node.election.needs_round().await {
                        node.election.start("no known master", peers);
                    } else {
                        node.election.check_deadline(peers).await;
                    }
                }
                event = events.recv() => match event {
                    Ok(ClusterEvent::MasterDown(master)) => {
                        warn!(master = %master, "Master down, starting election");
                        let peers = node.detector.reachable_entries().await;
                        node.election.start("master down", peers);
                    }
                    Ok(ClusterEvent::LeaderChanged { .. }) => {
                        if let Err(e) = node.persist_election().await {
                            warn!(error = %e, "Failed to persist election state");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Election monitor lagged behind cluster events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        debug!("Election monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_become_coordinator_increments_term() {
        let mut state = ElectionState::new("c");
        state.observe_term(4);
        state.begin_round(false);
        assert_eq!(state.become_coordinator(), 5);
        assert_eq!(state.phase, Phase::IsCoordinator);
        assert_eq!(state.current_master.as_deref(), Some("c"));
    }

    #[test]
    fn test_reassert_moves_past_candidate_term() {
        let mut state = ElectionState::new("c");
        state.become_coordinator();
        state.observe_term(4);
        assert_eq!(state.reassert(), Some(5));
        assert!(state.on_coordinator("c", 5));

        let mut follower = ElectionState::new("a");
        assert_eq!(follower.reassert(), None);
    }

    #[test]
    fn test_stale_coordinator_ignored() {
        let mut state = ElectionState::new("a");
        assert!(state.on_coordinator("c", 3));
        assert!(!state.on_coordinator("b", 2));
        assert_eq!(state.current_master.as_deref(), Some("c"));
        assert_eq!(state.term, 3);
        assert_eq!(state.phase, Phase::Idle);
    }

    #[test]
    fn test_equal_term_prefers_higher_leader() {
        let mut state = ElectionState::new("a");
        assert!(state.on_coordinator("b", 2));
        assert!(!state.on_coordinator("a", 2));
        assert!(state.on_coordinator("c", 2));
        assert_eq!(state.current_master.as_deref(), Some("c"));
    }

    #[test]
    fn test_equal_term_after_observed_bump_is_accepted() {
        // Master "c" accepted at term 2; an ELECTION raised the term to 3.
        let mut state = ElectionState::new("a");
        assert!(state.on_coordinator("c", 2));
        state.observe_term(3);
        assert!(state.on_coordinator("b", 3));
        assert_eq!(state.current_master.as_deref(), Some("b"));
    }

    #[test]
    fn test_coordinator_steps_down_for_newer_term() {
        let mut state = ElectionState::new("b");
        state.become_coordinator();
        assert!(state.on_coordinator("c", 5));
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.current_master.as_deref(), Some("c"));
    }

    #[test]
    fn test_bully_expiry_without_alive_takes_over() {
        let t0 = Instant::now();
        let mut state = ElectionState::new("b");
        state.begin_round(false);
        state.await_coordinator(t0 + secs(5));

        assert_eq!(state.expire(t0 + secs(1), ElectionStrategy::Bully, true), Expiry::Pending);
        assert_eq!(
            state.expire(t0 + secs(6), ElectionStrategy::Bully, true),
            Expiry::BecameCoordinator(1)
        );
        assert_eq!(state.phase, Phase::IsCoordinator);
    }

    #[test]
    fn test_bully_expiry_after_alive_retries() {
        let t0 = Instant::now();
        let mut state = ElectionState::new("a");
        state.begin_round(false);
        state.await_coordinator(t0 + secs(5));
        state.on_alive(3, t0 + secs(8));
        assert_eq!(state.term, 3);

        // Refreshed deadline
        assert_eq!(state.expire(t0 + secs(6), ElectionStrategy::Bully, true), Expiry::Pending);
        assert_eq!(state.expire(t0 + secs(9), ElectionStrategy::Bully, true), Expiry::Retry);

        state.begin_round(true);
        assert_eq!(state.term, 4);
    }

    #[test]
    fn test_ineligible_node_abandons() {
        let t0 = Instant::now();
        let mut state = ElectionState::new("z");
        state.begin_round(false);
        state.await_coordinator(t0);
        assert_eq!(state.expire(t0, ElectionStrategy::Bully, false), Expiry::Abandoned);
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.needs_round());
    }

    #[test]
    fn test_first_claim_wins_term() {
        let t0 = Instant::now();
        let mut state = ElectionState::new("a");
        assert!(state.on_puzzle(1, "x", t0 + secs(5), true));
        // Same puzzle again does not start a second solver.
        assert!(!state.on_puzzle(1, "x", t0 + secs(5), true));

        assert!(state.accept_claim(1, "b", "x"));
        assert!(!state.accept_claim(1, "c", "x"));
        assert!(state.accept_claim(1, "b", "x"));
        assert_eq!(state.current_master.as_deref(), Some("b"));

        // Settled term: puzzles for it are ignored, newer ones are not.
        assert!(!state.on_puzzle(1, "y", t0, true));
        assert!(state.on_puzzle(2, "y", t0, true));
    }

    #[test]
    fn test_claim_without_issued_puzzle_is_rejected() {
        let t0 = Instant::now();
        let mut state = ElectionState::new("a");

        // No puzzle seen for the term at all.
        assert!(!state.accept_claim(1000, "node-9", "self-chosen"));
        assert_eq!(state.current_master, None);
        assert_eq!(state.term, 0);

        // A puzzle exists, but the claim answers a different challenge.
        state.on_puzzle(3, "issued", t0 + secs(5), false);
        assert!(!state.accept_claim(3, "node-9", "self-chosen"));
        assert!(!state.accept_claim(4, "node-9", "issued"));
        assert_eq!(state.current_master, None);

        assert!(state.accept_claim(3, "node-9", "issued"));
        assert_eq!(state.current_master.as_deref(), Some("node-9"));
    }

    #[test]
    fn test_own_puzzle_is_claimable() {
        let mut state = ElectionState::new("a");
        let term = state.begin_puzzle("mine", Instant::now() + secs(5), true);
        assert!(state.accept_claim(term, "a", "mine"));
        assert_eq!(state.phase, Phase::IsCoordinator);
    }

    #[test]
    fn test_older_puzzles_are_forgotten() {
        let t0 = Instant::now();
        let mut state = ElectionState::new("a");
        state.on_puzzle(1, "old", t0, false);
        state.on_puzzle(2, "new", t0, false);
        assert!(!state.accept_claim(2, "b", "old"));
        assert!(state.accept_claim(2, "b", "new"));
    }

    #[test]
    fn test_double_claim_converges_on_higher_id() {
        // "a" accepted b's claim, "d" accepted c's. Both COORDINATORs cross.
        let t0 = Instant::now();
        let mut a = ElectionState::new("a");
        let mut d = ElectionState::new("d");
        a.on_puzzle(1, "x", t0, false);
        d.on_puzzle(1, "x", t0, false);
        assert!(a.accept_claim(1, "b", "x"));
        assert!(d.accept_claim(1, "c", "x"));

        assert!(a.on_coordinator("c", 1));
        assert!(!d.on_coordinator("b", 1));
        assert_eq!(a.current_master, d.current_master);
    }

    fn pow_election(id: &str) -> Arc<LeaderElection> {
        let config = ElectionConfig {
            mode: ElectionMode::ProofOfWork,
            timeout: secs(5),
            pow_difficulty: 4,
        };
        LeaderElection::new(
            ElectionState::new(id),
            false,
            &config,
            ClusterTransport::new(Duration::from_millis(100)),
            EventBus::new(),
        )
    }

    fn claim(sender: &str, term: u64, challenge: &str) -> Claim {
        let deadline = Instant::now() + secs(30);
        let nonce = pow::solve(challenge, sender, 4, deadline).unwrap();
        Claim {
            header: Header::now(sender),
            term,
            challenge: challenge.to_string(),
            difficulty: 4,
            nonce,
        }
    }

    fn accepted(reply: PeerMessage) -> bool {
        matches!(reply, PeerMessage::Ack(ack) if ack.accepted)
    }

    #[tokio::test]
    async fn test_claim_needs_a_broadcast_puzzle() {
        let election = pow_election("node-1");

        // Valid work on a challenge nobody issued.
        let forged = claim("node-9", 1000, "self-chosen");
        assert!(!accepted(election.handle_claim(&forged).await));
        let status = election.status();
        assert_eq!(status.current_master, None);
        assert_eq!(status.term, 0);

        let puzzle = Puzzle {
            header: Header::now("node-2"),
            term: 1,
            challenge: "issued".to_string(),
            difficulty: 4,
        };
        assert!(accepted(election.handle_puzzle(puzzle, Vec::new()).await));

        assert!(!accepted(election.handle_claim(&claim("node-9", 1, "self-chosen")).await));
        assert!(accepted(election.handle_claim(&claim("node-9", 1, "issued")).await));
        assert_eq!(election.status().current_master.as_deref(), Some("node-9"));
    }

    #[tokio::test]
    async fn test_oversized_puzzle_is_ignored() {
        let election = pow_election("node-1");
        let puzzle = Puzzle {
            header: Header::now("node-2"),
            term: 1,
            challenge: "hard".to_string(),
            difficulty: 200,
        };
        assert!(!accepted(election.handle_puzzle(puzzle, Vec::new()).await));
        assert_eq!(election.status().phase, Phase::Idle);
        assert_eq!(election.status().term, 0);
    }

    #[test]
    fn test_configured_difficulty_is_capped() {
        let config = ElectionConfig {
            mode: ElectionMode::ProofOfWork,
            timeout: secs(5),
            pow_difficulty: 90,
        };
        assert_eq!(
            ElectionStrategy::from_config(&config),
            ElectionStrategy::ProofOfWork {
                difficulty: pow::MAX_DIFFICULTY
            }
        );
    }

    #[test]
    fn test_restore_never_resumes_as_coordinator() {
        let restored = ElectionState::restore(
            "c",
            PersistedElection {
                term: 7,
                current_master: Some("c".into()),
            },
        );
        assert_eq!(restored.term, 7);
        assert_eq!(restored.current_master, None);
        assert_eq!(restored.phase, Phase::Idle);
    }

    #[test]
    fn test_initial_master() {
        let mut state = ElectionState::new("a");
        state.set_initial_master("a");
        assert_eq!(state.phase, Phase::IsCoordinator);
        let mut other = ElectionState::new("b");
        other.set_initial_master("a");
        assert_eq!(other.phase, Phase::Idle);
        assert_eq!(other.current_master.as_deref(), Some("a"));
    }
}
