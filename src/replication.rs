//! Replication task coordinator.
//!
//! One task per `doc_id`. Each target gets its own worker that fetches the
//! content from the source and pushes it to the target, both under the
//! retry policy. Workers never cancel each other; the task settles once
//! every target has either succeeded or permanently failed.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::content::{ContentError, ContentTransport};
use crate::events::ClusterEvent;
use crate::index::{IndexError, LocationIndex};
use crate::storage::{FileMetadata, FileRecord, Storage};
use crate::{CoordinatorNode, CoreError};

// ============================================================================
// Retry policy
// ============================================================================

/// Bounded exponential backoff: attempt `n` (0-based) failing sleeps
/// `base_delay * 2^n` before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    debug!(what, attempt, error = %e, "Attempt failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(what, attempts = attempt + 1, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// ReplicationTask
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub doc_id: String,
    pub source_node: String,
    pub target_nodes: BTreeSet<String>,
    pub completed_nodes: BTreeSet<String>,
    pub failed_nodes: BTreeSet<String>,
    pub status: TaskStatus,
    /// Unix millis.
    pub created_at: u64,
}

impl ReplicationTask {
    pub fn new(doc_id: &str, source_node: &str, targets: impl IntoIterator<Item = String>) -> Self {
        let mut task = Self {
            doc_id: doc_id.to_string(),
            source_node: source_node.to_string(),
            target_nodes: targets.into_iter().collect(),
            completed_nodes: BTreeSet::new(),
            failed_nodes: BTreeSet::new(),
            status: TaskStatus::Pending,
            created_at: crate::unix_millis(),
        };
        if task.target_nodes.is_empty() {
            task.status = TaskStatus::Completed;
        }
        task
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Targets without a successful copy.
    pub fn missing_targets(&self) -> Vec<String> {
        self.target_nodes
            .difference(&self.completed_nodes)
            .cloned()
            .collect()
    }

    /// Source plus every target that holds a confirmed copy.
    pub fn holders(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.source_node).chain(self.completed_nodes.iter())
    }

    /// Count nodes that already hold a copy as completed targets, so a
    /// rescheduled task still knows about them.
    pub fn carry_holders(&mut self, holders: impl IntoIterator<Item = String>) {
        for holder in holders {
            if holder != self.source_node {
                self.target_nodes.insert(holder.clone());
                self.completed_nodes.insert(holder);
            }
        }
        self.settle();
    }

    /// Add targets to an in-flight task. Returns the ones that were new.
    pub fn merge_targets(&mut self, targets: &[String]) -> Vec<String> {
        targets
            .iter()
            .filter(|t| self.target_nodes.insert((*t).clone()))
            .cloned()
            .collect()
    }

    pub fn record_outcome(&mut self, target: &str, success: bool) {
        if success {
            self.failed_nodes.remove(target);
            self.completed_nodes.insert(target.to_string());
        } else {
            self.failed_nodes.insert(target.to_string());
        }
        self.settle();
    }

    /// COMPLETED only when every target succeeded; FAILED once every target
    /// is resolved and at least one failed.
    fn settle(&mut self) {
        let resolved = self.completed_nodes.len() + self.failed_nodes.len();
        self.status = if self.completed_nodes.len() == self.target_nodes.len() {
            TaskStatus::Completed
        } else if resolved >= self.target_nodes.len() {
            TaskStatus::Failed
        } else {
            TaskStatus::InProgress
        };
    }
}

// ============================================================================
// ReplicationCoordinator
// ============================================================================

pub struct ReplicationCoordinator<T: Storage, C: ContentTransport> {
    tasks: RwLock<HashMap<String, ReplicationTask>>,
    index: Arc<LocationIndex>,
    content: Arc<C>,
    storage: Arc<T>,
    policy: RetryPolicy,
    factor: usize,
}

impl<T: Storage, C: ContentTransport> ReplicationCoordinator<T, C> {
    /// Build the coordinator, reloading persisted tasks. Tasks that were
    /// still running when the node stopped are marked FAILED so the
    /// reconciler repairs their missing targets.
    pub fn new(
        config: &ReplicationConfig,
        index: Arc<LocationIndex>,
        content: Arc<C>,
        storage: Arc<T>,
    ) -> Result<Arc<Self>, CoreError> {
        let mut tasks = HashMap::new();
        let rows = storage
            .list_replication_tasks()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        for data in rows {
            let mut task: ReplicationTask = rmp_serde::from_slice(&data)
                .map_err(|e| CoreError::Deserialization(e.to_string()))?;
            if !task.is_terminal() {
                for target in task.missing_targets() {
                    task.failed_nodes.insert(target);
                }
                task.settle();
            }
            tasks.insert(task.doc_id.clone(), task);
        }

        Ok(Arc::new(Self {
            tasks: RwLock::new(tasks),
            index,
            content,
            storage,
            policy: RetryPolicy::from_config(config),
            factor: config.factor,
        }))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Replicate `doc_id` from `source_node` to the nodes the index picks.
    /// Uses the indexed embedding when none is given.
    pub async fn replicate_document(
        self: &Arc<Self>,
        doc_id: &str,
        source_node: &str,
        embedding: Option<Vec<f32>>,
        exclude: &[String],
    ) -> Result<ReplicationTask, CoreError> {
        self.schedule(doc_id, source_node, embedding, self.factor, exclude, exclude)
            .await
    }

    /// Point-in-time copy of a task.
    pub async fn get_task_status(&self, doc_id: &str) -> Option<ReplicationTask> {
        self.tasks.read().await.get(doc_id).cloned()
    }

    pub async fn tasks(&self) -> Vec<ReplicationTask> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        tasks
    }

    pub async fn failed_tasks(&self) -> Vec<ReplicationTask> {
        let mut tasks = self.tasks().await;
        tasks.retain(|t| t.status == TaskStatus::Failed);
        tasks
    }

    /// Copy `doc_id` from `source` to `target` and record the target's
    /// metadata row as a copy of the source's.
    pub async fn push_replica(&self, doc_id: &str, source: &str, target: &str) -> Result<(), CoreError> {
        self.transfer(doc_id, source, target).await?;
        self.record_copy(doc_id, source, target)
    }

    /// Re-push only the targets a FAILED task is missing. Returns the task
    /// as rescheduled, or None if there is nothing to repair.
    pub async fn repair_failed(self: &Arc<Self>, doc_id: &str) -> Result<Option<ReplicationTask>, CoreError> {
        let (snapshot, missing) = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(doc_id) else {
                return Ok(None);
            };
            if task.status != TaskStatus::Failed {
                return Ok(None);
            }
            let missing = task.missing_targets();
            task.failed_nodes.clear();
            task.status = TaskStatus::InProgress;
            self.persist(task)?;
            (task.clone(), missing)
        };

        info!(doc_id = %doc_id, targets = ?missing, "Repairing failed replication");
        self.spawn_workers(&snapshot.doc_id, &snapshot.source_node, missing);
        Ok(Some(snapshot))
    }

    /// Re-replicate documents that lost a copy on `down`. Returns the doc
    /// ids that were rescheduled.
    pub async fn handle_node_down(self: &Arc<Self>, down: &str, offline: &[String]) -> Vec<String> {
        let affected: Vec<ReplicationTask> = self
            .tasks()
            .await
            .into_iter()
            .filter(|t| t.source_node == down || t.completed_nodes.contains(down))
            .collect();

        let mut rescheduled = Vec::new();
        for task in affected {
            let live_holders: Vec<String> = task
                .holders()
                .filter(|n| *n != down && !offline.contains(n))
                .cloned()
                .collect();
            let Some(new_source) = live_holders.first().cloned() else {
                warn!(doc_id = %task.doc_id, node = %down, "No live copy left to re-replicate from");
                continue;
            };

            let mut lost: Vec<String> = offline.to_vec();
            lost.push(down.to_string());
            let mut exclude = lost.clone();
            exclude.extend(live_holders.iter().cloned());

            match self
                .schedule(&task.doc_id, &new_source, None, 1, &exclude, &lost)
                .await
            {
                Ok(_) => {
                    info!(doc_id = %task.doc_id, source = %new_source, lost = %down, "Re-replicating after node loss");
                    rescheduled.push(task.doc_id);
                }
                Err(e) => {
                    warn!(doc_id = %task.doc_id, error = %e, "Failed to reschedule replication");
                }
            }
        }
        rescheduled
    }

    // -- Internal --

    /// Start or extend the task for `doc_id`. A finished task is replaced,
    /// but its holders that are not in `lost` carry over as completed.
    async fn schedule(
        self: &Arc<Self>,
        doc_id: &str,
        source_node: &str,
        embedding: Option<Vec<f32>>,
        count: usize,
        exclude: &[String],
        lost: &[String],
    ) -> Result<ReplicationTask, CoreError> {
        let embedding = match embedding {
            Some(embedding) => embedding,
            None => self
                .index
                .document(doc_id)
                .await
                .map(|d| d.embedding)
                .ok_or_else(|| IndexError::UnknownDocument(doc_id.to_string()))?,
        };
        let targets = self
            .index
            .select_replica_nodes_excluding(source_node, &embedding, count, exclude)
            .await?;

        let (snapshot, to_start) = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(doc_id) {
                Some(task) if !task.is_terminal() => {
                    let added = task.merge_targets(&targets);
                    debug!(doc_id = %doc_id, added = ?added, "Merged into in-flight replication");
                    self.persist(task)?;
                    (task.clone(), added)
                }
                previous => {
                    let carried: Vec<String> = previous
                        .map(|old| {
                            old.holders()
                                .filter(|n| !lost.contains(n))
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    let mut task = ReplicationTask::new(doc_id, source_node, targets.clone());
                    task.carry_holders(carried);
                    let to_start: Vec<String> = targets
                        .into_iter()
                        .filter(|t| !task.completed_nodes.contains(t))
                        .collect();
                    self.persist(&task)?;
                    tasks.insert(doc_id.to_string(), task.clone());
                    (task, to_start)
                }
            }
        };

        if to_start.is_empty() {
            info!(doc_id = %doc_id, "No replica targets available, nothing to replicate");
        } else {
            info!(doc_id = %doc_id, source = %snapshot.source_node, targets = ?to_start, "Replication scheduled");
        }
        self.spawn_workers(&snapshot.doc_id, &snapshot.source_node, to_start);
        Ok(snapshot)
    }

    fn spawn_workers(self: &Arc<Self>, doc_id: &str, source: &str, targets: Vec<String>) {
        for target in targets {
            let coordinator = Arc::clone(self);
            let doc_id = doc_id.to_string();
            let source = source.to_string();

            tokio::spawn(async move {
                let success = match coordinator.push_replica(&doc_id, &source, &target).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(doc_id = %doc_id, target = %target, error = %e, "Replica target failed permanently");
                        false
                    }
                };
                coordinator.finish_target(&doc_id, &target, success).await;
            });
        }
    }

    async fn finish_target(&self, doc_id: &str, target: &str, success: bool) {
        let snapshot = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(doc_id) else {
                return;
            };
            task.record_outcome(target, success);
            if let Err(e) = self.persist(task) {
                warn!(doc_id = %doc_id, error = %e, "Failed to persist replication task");
            }
            task.clone()
        };

        match snapshot.status {
            TaskStatus::Completed => {
                info!(doc_id = %doc_id, targets = snapshot.target_nodes.len(), "Replication completed")
            }
            TaskStatus::Failed => warn!(
                doc_id = %doc_id,
                completed = ?snapshot.completed_nodes,
                failed = ?snapshot.failed_nodes,
                "Replication failed, left for repair"
            ),
            _ => {}
        }
    }

    async fn transfer(&self, doc_id: &str, source: &str, target: &str) -> Result<(), ContentError> {
        let content: Bytes = self
            .policy
            .run("fetch", || self.content.fetch(source, doc_id))
            .await?;
        self.policy
            .run("push", || self.content.push(target, doc_id, content.clone()))
            .await?;
        debug!(doc_id = %doc_id, source = %source, target = %target, "Replica pushed");
        Ok(())
    }

    fn record_copy(&self, doc_id: &str, source: &str, target: &str) -> Result<(), CoreError> {
        let Some(row) = self.storage.file(source, doc_id)? else {
            return Ok(());
        };
        self.storage.put_file(&FileRecord {
            node_id: target.to_string(),
            restored_from_checkpoint: false,
            ..row
        })
    }

    fn persist(&self, task: &ReplicationTask) -> Result<(), CoreError> {
        let data =
            rmp_serde::to_vec_named(task).map_err(|e| CoreError::Serialization(e.to_string()))?;
        self.storage
            .put_replication_task(&task.doc_id, &data)
            .map_err(|e| CoreError::Storage(e.to_string()))
    }
}

impl<T: Storage, C: ContentTransport> std::fmt::Debug for ReplicationCoordinator<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("policy", &self.policy)
            .field("factor", &self.factor)
            .finish()
    }
}

// ============================================================================
// Node-down recovery task
// ============================================================================

/// Re-replicate after node loss. Only the current coordinator acts, so a
/// lost copy is rescheduled once cluster-wide.
pub(crate) fn start_recovery_task<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
) -> JoinHandle<()> {
    let mut events = node.events.subscribe();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = node.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ClusterEvent::NodeDown(down)) => {
                    if !node.election.is_coordinator().await {
                        continue;
                    }
                    let offline = node.detector.offline_peers().await;
                    let rescheduled = node.replication.handle_node_down(&down, &offline).await;
                    if !rescheduled.is_empty() {
                        info!(node = %down, documents = rescheduled.len(), "Recovery replication scheduled");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Recovery task lagged behind cluster events");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Replication recovery task stopped");
    })
}
