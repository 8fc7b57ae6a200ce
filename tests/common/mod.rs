//! Shared test helpers for docweave integration tests.
//!
//! Provides an in-memory `ContentTransport` and utilities for spinning up
//! multi-node clusters on localhost with real TCP.

// Each test binary compiles this module independently and only uses a subset
// of exports, so unused items are expected.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docweave::config::{ElectionConfig, MutexConfig, ReplicationConfig};
use docweave::{
    Config, ContentError, ContentTransport, CoordinatorNode, DiscoveryConfig, PeerConfig,
    PeerStatus, Phase, RedbStorage, ReplicationTask,
};
use tempfile::TempDir;
use tokio_util::bytes::Bytes;

// ============================================================================
// MemoryContent — in-memory content transport
// ============================================================================

/// Content "stored on" each node, shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryContent {
    files: Arc<Mutex<HashMap<(String, String), Bytes>>>,
    failing_pushes: Arc<Mutex<HashSet<String>>>,
}

impl MemoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, node_id: &str, doc_id: &str, content: &'static [u8]) {
        self.files.lock().unwrap().insert(
            (node_id.to_string(), doc_id.to_string()),
            Bytes::from_static(content),
        );
    }

    pub fn get(&self, node_id: &str, doc_id: &str) -> Option<Bytes> {
        self.files
            .lock()
            .unwrap()
            .get(&(node_id.to_string(), doc_id.to_string()))
            .cloned()
    }

    /// Make every push to `node_id` fail until [`heal`](Self::heal).
    pub fn fail_pushes_to(&self, node_id: &str) {
        self.failing_pushes.lock().unwrap().insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.failing_pushes.lock().unwrap().remove(node_id);
    }
}

#[async_trait]
impl ContentTransport for MemoryContent {
    async fn fetch(&self, node_id: &str, doc_id: &str) -> Result<Bytes, ContentError> {
        self.get(node_id, doc_id).ok_or_else(|| ContentError::NotFound {
            node_id: node_id.to_string(),
            doc_id: doc_id.to_string(),
        })
    }

    async fn push(&self, node_id: &str, doc_id: &str, content: Bytes) -> Result<(), ContentError> {
        if self.failing_pushes.lock().unwrap().contains(node_id) {
            return Err(ContentError::Status {
                node_id: node_id.to_string(),
                status: 503,
            });
        }
        self.files
            .lock()
            .unwrap()
            .insert((node_id.to_string(), doc_id.to_string()), content);
        Ok(())
    }
}

// ============================================================================
// Port allocation
// ============================================================================

/// Bind to port 0 and return the OS-assigned port.
///
/// The listener is dropped immediately so the port is available for the node
/// to bind. There's a small race window, but it's fine for tests.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Node helpers
// ============================================================================

pub type Node = CoordinatorNode<RedbStorage, MemoryContent>;

/// Fast timings for tests.
pub fn test_config(node_id: &str, cluster_port: u16, peers: Vec<PeerConfig>) -> Config {
    Config {
        node_id: node_id.to_string(),
        cluster_port,
        advertise_address: Some(format!("127.0.0.1:{cluster_port}")),
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(600),
        election: ElectionConfig {
            timeout: Duration::from_millis(500),
            ..ElectionConfig::default()
        },
        mutex: MutexConfig {
            acquire_timeout: Duration::from_secs(3),
            quorum: None,
        },
        replication: ReplicationConfig {
            factor: 2,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(10),
        },
        reconcile_interval: Duration::ZERO,
        embedding_dim: 4,
        request_timeout: Duration::from_millis(500),
        discovery: DiscoveryConfig {
            dns_name: None,
            peers,
            poll_interval: Duration::from_millis(200),
        },
        ..Config::default()
    }
}

/// A node with its temp dir guard. Not started.
pub struct OfflineNode {
    pub node: Arc<Node>,
    pub content: MemoryContent,
    _dir: TempDir,
}

/// Build a node that is never started, for exercising local components.
pub fn local_node(node_id: &str) -> OfflineNode {
    let dir = TempDir::new().unwrap();
    let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
    let content = MemoryContent::new();
    let config = test_config(node_id, free_port(), Vec::new());
    let node = CoordinatorNode::new(config, storage, content.clone()).unwrap();

    OfflineNode {
        node,
        content,
        _dir: dir,
    }
}

/// A running test node with its temp dir guard.
pub struct TestNode {
    pub node: Arc<Node>,
    pub content: MemoryContent,
    _handles: Vec<tokio::task::JoinHandle<()>>,
    _dir: TempDir,
}

impl TestNode {
    pub fn master(&self) -> Option<String> {
        self.node.coordination_status().current_master
    }

    pub fn is_coordinator(&self) -> bool {
        self.node.coordination_status().phase == Phase::IsCoordinator
    }
}

/// Spawn and start a single node.
pub async fn spawn_node(config: Config, content: MemoryContent) -> TestNode {
    let dir = TempDir::new().unwrap();
    let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

    let node = CoordinatorNode::new(config, storage, content.clone()).unwrap();
    let handles = node.start().await.unwrap();

    TestNode {
        node,
        content,
        _handles: handles,
        _dir: dir,
    }
}

/// Spawn a cluster of N nodes on localhost with random ports.
///
/// Returns nodes in order `[node-1, node-2, ..., node-N]`.
pub async fn spawn_cluster(n: usize) -> Vec<TestNode> {
    spawn_cluster_with(n, |_| {}).await
}

/// Like [`spawn_cluster`], letting the caller adjust each node's config.
pub async fn spawn_cluster_with<F: Fn(&mut Config)>(n: usize, tweak: F) -> Vec<TestNode> {
    assert!(n >= 1, "cluster must have at least 1 node");

    // Allocate ports first so every node knows the full peer list at startup.
    let ports: Vec<u16> = (0..n).map(|_| free_port()).collect();
    let content = MemoryContent::new();

    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let node_id = format!("node-{}", i + 1);
        let peers: Vec<PeerConfig> = ports
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, port)| PeerConfig {
                node_id: format!("node-{}", j + 1),
                address: format!("127.0.0.1:{port}"),
                can_be_master: true,
            })
            .collect();

        let mut config = test_config(&node_id, ports[i], peers);
        tweak(&mut config);
        nodes.push(spawn_node(config, content.clone()).await);
    }

    nodes
}

// ============================================================================
// Waiting
// ============================================================================

/// Wait until every node agrees on one master and exactly one node is
/// coordinator (up to `timeout`). Returns the master id.
pub async fn wait_for_master(nodes: &[TestNode], timeout: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let masters: HashSet<Option<String>> = nodes.iter().map(TestNode::master).collect();
        let coordinators = nodes.iter().filter(|n| n.is_coordinator()).count();

        if masters.len() == 1 && coordinators == 1 {
            if let Some(Some(master)) = masters.into_iter().next() {
                return Some(master);
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until every node reports the same election term (up to `timeout`).
/// Returns that term.
pub async fn wait_for_common_term(nodes: &[TestNode], timeout: Duration) -> Option<u64> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let terms: HashSet<u64> = nodes
            .iter()
            .map(|n| n.node.coordination_status().term)
            .collect();
        if terms.len() == 1 {
            return terms.into_iter().next();
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until every node sees every other node ONLINE (up to `timeout`).
pub async fn wait_for_online(nodes: &[TestNode], timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let mut all_online = true;
        for n in nodes {
            let info = n.node.cluster_info().await;
            if info.peers.len() != nodes.len() - 1
                || info.peers.iter().any(|p| p.status != PeerStatus::Online)
            {
                all_online = false;
                break;
            }
        }

        if all_online {
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until the replication task for `doc_id` is COMPLETED or FAILED.
pub async fn wait_for_task(node: &Node, doc_id: &str, timeout: Duration) -> Option<ReplicationTask> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(task) = node.task_status(doc_id).await {
            if task.is_terminal() {
                return Some(task);
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
