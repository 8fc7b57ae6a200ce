//! docweave — coordination core for a distributed document-search cluster.
//!
//! Provides heartbeat failure detection, leader election (Bully or
//! proof-of-work), a Ricart–Agrawala distributed mutex, a semantic location
//! index, replication with retry/backoff, last-write-wins reconciliation, and
//! coordinated checkpoints, over TCP + MessagePack.
//!
//! # Quick start
//!
//! 1. Construct a [`Config`] (by hand or with [`Config::from_env`]).
//! 2. Pick a storage backend ([`RedbStorage`] included) and a
//!    [`ContentTransport`] ([`HttpContentTransport`] included).
//! 3. Create a [`CoordinatorNode`] and call [`start`](CoordinatorNode::start).
//! 4. Call [`shutdown`](CoordinatorNode::shutdown) to stop every loop and
//!    persist election and peer state.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod content;
pub mod detector;
pub mod discovery;
pub mod election;
pub mod events;
pub mod index;
pub mod mutex;
pub mod pow;
pub mod reconciler;
pub mod replication;
pub mod rpc;
pub mod storage;
pub mod transport;
pub mod wire;

mod handlers;
mod heartbeat;
mod server;

pub use checkpoint::{CheckpointError, CheckpointManager, GlobalCheckpoint, RestoreReport};
pub use config::{Config, DiscoveryConfig, ElectionMode, PeerConfig};
pub use content::{ContentError, ContentTransport, HttpContentTransport};
pub use detector::{FailureDetector, PeerEntry, PeerStatus};
pub use election::{CoordinationStatus, ElectionOutcome, Phase};
pub use events::{ClusterEvent, EventBus};
pub use index::{IndexError, LocationIndex};
pub use reconciler::ReconcileReport;
pub use replication::{ReplicationTask, TaskStatus};
pub use storage::{FileRecord, RedbStorage, RedbStorageError, Storage};
pub use transport::ClusterTransport;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::election::{ElectionState, LeaderElection, PersistedElection};
use crate::mutex::DistributedMutex;
use crate::reconciler::Reconciler;
use crate::replication::ReplicationCoordinator;
use crate::storage::FileMetadata;

/// Wall-clock unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// CoreError
// ============================================================================

/// Errors returned by coordination operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Content transport error: {0}")]
    Content(#[from] ContentError),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Election did not resolve in time")]
    ElectionTimeout,
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Lock on {0} is already held or requested by this node")]
    LockBusy(String),
    #[error("Timed out acquiring lock on {0}")]
    LockTimeout(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

// ============================================================================
// CoordinatorNode
// ============================================================================

/// A cluster node running the coordination core.
///
/// Generic over `T` (your [`Storage`] backend) and `C` (your
/// [`ContentTransport`]). Every component owns its own state; the node only
/// composes them and runs their background loops.
pub struct CoordinatorNode<T: Storage, C: ContentTransport> {
    pub(crate) config: Config,
    pub(crate) advertise_address: String,
    pub(crate) events: EventBus,
    pub(crate) detector: FailureDetector,
    pub(crate) election: Arc<LeaderElection>,
    pub(crate) mutex: DistributedMutex,
    pub(crate) index: Arc<LocationIndex>,
    pub(crate) replication: Arc<ReplicationCoordinator<T, C>>,
    pub(crate) reconciler: Reconciler<T, C>,
    pub(crate) checkpoints: CheckpointManager<T>,
    pub(crate) storage: Arc<T>,
    pub(crate) transport: Arc<ClusterTransport>,
    pub(crate) shutdown: CancellationToken,
}

/// Convenience alias for `CoordinatorNode` using the bundled backends.
pub type RedbNode = CoordinatorNode<RedbStorage, HttpContentTransport>;

impl<T: Storage, C: ContentTransport> CoordinatorNode<T, C> {
    /// Create a new node.
    ///
    /// Loads the persisted election state and replication tasks from
    /// `storage`. Nothing runs until [`start`](Self::start).
    pub fn new(config: Config, storage: T, content: C) -> Result<Arc<Self>, CoreError> {
        let storage = Arc::new(storage);
        let content = Arc::new(content);
        let events = EventBus::new();
        let transport = ClusterTransport::new(config.request_timeout);

        let mut state = ElectionState::restore(&config.node_id, load_election(storage.as_ref())?);
        if state.current_master.is_none() {
            if let Some(master) = &config.initial_master {
                state.set_initial_master(master);
            }
        }

        let election = LeaderElection::new(
            state,
            config.can_be_master,
            &config.election,
            Arc::clone(&transport),
            events.clone(),
        );
        let index = Arc::new(LocationIndex::new(config.embedding_dim));
        let replication = ReplicationCoordinator::new(
            &config.replication,
            Arc::clone(&index),
            content,
            Arc::clone(&storage),
        )?;
        let advertise_address = config
            .advertise_address
            .clone()
            .unwrap_or_else(|| discovery::compute_cluster_address(config.cluster_port));

        Ok(Arc::new(Self {
            detector: FailureDetector::new(config.heartbeat_timeout, events.clone()),
            mutex: DistributedMutex::new(&config.node_id, &config.mutex, Arc::clone(&transport)),
            reconciler: Reconciler::new(Arc::clone(&storage), Arc::clone(&replication)),
            checkpoints: CheckpointManager::new(Arc::clone(&storage)),
            config,
            advertise_address,
            events,
            election,
            index,
            replication,
            storage,
            transport,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Bind the cluster port, register persisted and configured peers, and
    /// spawn every background loop.
    ///
    /// Returns join handles for the spawned tasks. They all exit after
    /// [`shutdown`](Self::shutdown).
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, CoreError> {
        let listener = server::bind(self.config.cluster_port).await?;

        for peer in load_peers(self.storage.as_ref())? {
            self.detector
                .register_peer(&peer.node_id, &peer.address, peer.can_be_master)
                .await;
        }
        for peer in &self.config.discovery.peers {
            self.remember_peer(&peer.node_id, &peer.address, peer.can_be_master)
                .await;
        }
        if self.config.is_single_node() {
            info!("Running in single-node mode (no peers configured)");
        }

        let mut handles = vec![
            server::start_cluster_server(Arc::clone(self), listener),
            heartbeat::start_heartbeat_task(Arc::clone(self)),
            heartbeat::start_failure_checker(Arc::clone(self)),
            election::start_election_monitor(Arc::clone(self)),
            replication::start_recovery_task(Arc::clone(self)),
            reconciler::start_reconciler_task(Arc::clone(self)),
            checkpoint::start_checkpoint_task(Arc::clone(self)),
        ];
        if let Some(disc) = discovery::Discovery::from_config(&self.config) {
            handles.push(discovery::start_discovery_task(
                Arc::clone(self),
                disc,
                self.config.discovery.poll_interval,
            ));
        }

        info!(
            node = %self.config.node_id,
            address = %self.advertise_address,
            can_be_master = self.config.can_be_master,
            "Coordinator node started"
        );
        Ok(handles)
    }

    /// Stop every background loop and persist election and peer state.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.shutdown.cancel();
        self.persist_election().await?;
        for peer in self.detector.entries().await {
            self.persist_peer(&peer)?;
        }
        info!(node = %self.config.node_id, "Coordinator node stopped");
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn address(&self) -> &str {
        &self.advertise_address
    }

    pub fn storage(&self) -> &T {
        &self.storage
    }

    /// Subscribe to membership and leadership events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    // -- Election --

    /// Run an election round now and wait for its outcome.
    pub async fn start_election(&self, reason: &'static str) -> Result<ElectionOutcome, CoreError> {
        let min_term = self.election.term().await + 1;
        let peers = self.detector.reachable_entries().await;
        info!(reason = %reason, "Election requested");
        self.election.start(reason, peers);
        self.election
            .wait_for_outcome(min_term, self.config.election.timeout * 3)
            .await
    }

    pub fn coordination_status(&self) -> CoordinationStatus {
        self.election.status()
    }

    pub async fn is_coordinator(&self) -> bool {
        self.election.is_coordinator().await
    }

    // -- Mutex --

    /// Enter the cluster-wide critical section for `resource_id`.
    pub async fn acquire_lock(&self, resource_id: &str) -> Result<(), CoreError> {
        let peers = self.detector.reachable_entries().await;
        self.mutex.acquire(resource_id, &peers).await
    }

    /// Returns whether the lock was held (or requested) by this node.
    pub async fn release_lock(&self, resource_id: &str) -> bool {
        self.mutex.release(resource_id).await
    }

    // -- Checkpoints --

    /// Coordinated checkpoint across this node and every online peer.
    pub async fn create_checkpoint(&self) -> Result<u64, CoreError> {
        let mut nodes = self.detector.online_peers().await;
        nodes.push(self.config.node_id.clone());
        self.checkpoints.create_coordinated_checkpoint(&nodes)
    }

    pub fn restore_from_checkpoint(&self, checkpoint_id: u64) -> Result<RestoreReport, CoreError> {
        self.checkpoints.restore_from_checkpoint(checkpoint_id)
    }

    pub fn checkpoints(&self) -> &CheckpointManager<T> {
        &self.checkpoints
    }

    // -- Location index --

    pub async fn register_document(
        &self,
        doc_id: &str,
        filename: &str,
        node_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), CoreError> {
        Ok(self
            .index
            .register_document(doc_id, filename, node_id, embedding)
            .await?)
    }

    pub async fn remove_document(&self, doc_id: &str) -> Result<(), CoreError> {
        self.index.remove_document(doc_id).await?;
        Ok(())
    }

    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        node_filter: Option<&[String]>,
    ) -> Result<Vec<(String, f32)>, CoreError> {
        Ok(self.index.search(query, top_k, node_filter).await?)
    }

    pub async fn find_nodes_for_query(
        &self,
        query: &[f32],
        max_nodes: usize,
    ) -> Result<Vec<(String, f32)>, CoreError> {
        Ok(self.index.find_nodes_for_query(query, max_nodes).await?)
    }

    pub fn index(&self) -> &LocationIndex {
        &self.index
    }

    // -- File metadata --

    /// Record (or overwrite) a node's metadata row for a stored file.
    pub fn record_file(&self, record: &FileRecord) -> Result<(), CoreError> {
        self.storage.put_file(record)
    }

    pub fn file_records(&self, node_id: Option<&str>) -> Result<Vec<FileRecord>, CoreError> {
        self.storage.files(node_id)
    }

    // -- Replication --

    /// Replicate `doc_id` from `source_node`, skipping offline nodes.
    pub async fn replicate_document(
        &self,
        doc_id: &str,
        source_node: &str,
        embedding: Option<Vec<f32>>,
    ) -> Result<ReplicationTask, CoreError> {
        let offline = self.detector.offline_peers().await;
        self.replication
            .replicate_document(doc_id, source_node, embedding, &offline)
            .await
    }

    pub async fn task_status(&self, doc_id: &str) -> Option<ReplicationTask> {
        self.replication.get_task_status(doc_id).await
    }

    /// Run one reconciliation pass now, regardless of role.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, CoreError> {
        self.reconciler.reconcile().await
    }

    // -- Introspection --

    pub async fn cluster_info(&self) -> ClusterInfo {
        let status = self.election.status();
        ClusterInfo {
            node_id: self.config.node_id.clone(),
            address: self.advertise_address.clone(),
            phase: status.phase,
            term: status.term,
            current_master: status.current_master,
            documents: self.index.len().await,
            peers: self
                .detector
                .peers()
                .await
                .into_iter()
                .map(|p| PeerInfo {
                    id: p.node_id,
                    address: p.address,
                    can_be_master: p.can_be_master,
                    status: p.status,
                    missed_beats: p.missed_beats,
                })
                .collect(),
        }
    }

    // -- Internal helpers --

    /// Register a peer on first contact and persist it. Returns true if the
    /// peer was new.
    pub(crate) async fn remember_peer(
        &self,
        node_id: &str,
        address: &str,
        can_be_master: bool,
    ) -> bool {
        if node_id == self.config.node_id {
            return false;
        }
        let added = self
            .detector
            .register_peer(node_id, address, can_be_master)
            .await;
        if added {
            let entry = PeerEntry {
                node_id: node_id.to_string(),
                address: address.to_string(),
                can_be_master,
            };
            if let Err(e) = self.persist_peer(&entry) {
                warn!(peer = %node_id, error = %e, "Failed to persist peer");
            }
        }
        added
    }

    pub(crate) async fn persist_election(&self) -> Result<(), CoreError> {
        let persisted = self.election.persisted().await;
        let data = rmp_serde::to_vec_named(&persisted)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        self.storage
            .put_node_state(&data)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        debug!(term = persisted.term, master = ?persisted.current_master, "Election state persisted");
        Ok(())
    }

    fn persist_peer(&self, peer: &PeerEntry) -> Result<(), CoreError> {
        let data =
            rmp_serde::to_vec_named(peer).map_err(|e| CoreError::Serialization(e.to_string()))?;
        self.storage
            .put_peer(&peer.node_id, &data)
            .map_err(|e| CoreError::Storage(e.to_string()))
    }
}

impl<T: Storage, C: ContentTransport> std::fmt::Debug for CoordinatorNode<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorNode")
            .field("node_id", &self.config.node_id)
            .field("address", &self.advertise_address)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ClusterInfo — public read-only cluster state
// ============================================================================

/// Snapshot of this node's view (returned by [`CoordinatorNode::cluster_info`]).
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub node_id: String,
    pub address: String,
    pub phase: Phase,
    pub term: u64,
    pub current_master: Option<String>,
    pub documents: usize,
    pub peers: Vec<PeerInfo>,
}

/// Information about a single peer node.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub can_be_master: bool,
    pub status: PeerStatus,
    pub missed_beats: u32,
}

// ============================================================================
// Persistence helpers
// ============================================================================

fn load_election<T: Storage>(storage: &T) -> Result<PersistedElection, CoreError> {
    match storage
        .get_node_state()
        .map_err(|e| CoreError::Storage(e.to_string()))?
    {
        Some(data) => {
            rmp_serde::from_slice(&data).map_err(|e| CoreError::Deserialization(e.to_string()))
        }
        None => Ok(PersistedElection::default()),
    }
}

fn load_peers<T: Storage>(storage: &T) -> Result<Vec<PeerEntry>, CoreError> {
    storage
        .list_peers()
        .map_err(|e| CoreError::Storage(e.to_string()))?
        .iter()
        .map(|data| {
            rmp_serde::from_slice(data).map_err(|e| CoreError::Deserialization(e.to_string()))
        })
        .collect()
}
