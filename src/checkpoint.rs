//! Coordinated checkpoints and backward recovery.
//!
//! A node checkpoint snapshots one node's file-metadata rows and seals them
//! with a SHA-256 over the canonical JSON form. A global checkpoint groups the
//! node checkpoints taken in one pass and is written last, so its presence
//! marks a usable recovery line. Snapshots are taken independently without a
//! message-flush barrier; the recovery line is approximate.
//!
//! Restore verifies every participant before touching any row, then replaces
//! all participants' rows in a single storage transaction.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::content::ContentTransport;
use crate::storage::{FileMetadata, FileRecord, NodeRows, Storage};
use crate::{CoordinatorNode, CoreError};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint {0} not found")]
    NotFound(u64),
    #[error("Checkpoint {checkpoint_id} references missing node checkpoint {node_checkpoint_id}")]
    MissingNodeCheckpoint {
        checkpoint_id: u64,
        node_checkpoint_id: u64,
    },
    #[error("Checkpoint {checkpoint_id} is corrupt: snapshot hash mismatch for node {node_id}")]
    CorruptCheckpoint { checkpoint_id: u64, node_id: String },
    #[error("Checkpoint {0} is not a valid recovery line")]
    NotRecoveryLine(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub file_id: String,
    pub content_hash: String,
    pub last_updated: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCheckpoint {
    pub node_id: String,
    pub timestamp: u64,
    pub files_snapshot: Vec<FileSnapshot>,
    pub checkpoint_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCheckpoint {
    pub timestamp: u64,
    pub participating_nodes: Vec<String>,
    /// Node checkpoint ids, aligned with `participating_nodes`.
    pub node_checkpoints: Vec<u64>,
    pub total_files: usize,
    pub valid_recovery_line: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored_nodes: Vec<String>,
    pub total_files: usize,
}

/// `hex(sha256(json(snapshot sorted by file_id)))`.
pub fn snapshot_hash(files: &[FileSnapshot]) -> Result<String, CoreError> {
    let mut sorted: Vec<&FileSnapshot> = files.iter().collect();
    sorted.sort_by(|a, b| a.file_id.cmp(&b.file_id));
    let canonical =
        serde_json::to_vec(&sorted).map_err(|e| CoreError::Serialization(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

impl NodeCheckpoint {
    /// Whether the stored hash still matches the stored snapshot.
    pub fn verify(&self) -> Result<bool, CoreError> {
        Ok(snapshot_hash(&self.files_snapshot)? == self.checkpoint_hash)
    }

    fn restored_rows(&self) -> Result<NodeRows, CoreError> {
        let rows = self
            .files_snapshot
            .iter()
            .map(|file| {
                let record = FileRecord {
                    node_id: self.node_id.clone(),
                    file_id: file.file_id.clone(),
                    content_hash: file.content_hash.clone(),
                    last_updated: file.last_updated,
                    restored_from_checkpoint: true,
                };
                rmp_serde::to_vec_named(&record)
                    .map(|data| (file.file_id.clone(), data))
                    .map_err(|e| CoreError::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((self.node_id.clone(), rows))
    }
}

pub struct CheckpointManager<T: Storage> {
    storage: Arc<T>,
}

impl<T: Storage> CheckpointManager<T> {
    pub fn new(storage: Arc<T>) -> Self {
        Self { storage }
    }

    /// Snapshot `node_id`'s current rows and append a node checkpoint.
    pub fn create_node_checkpoint(&self, node_id: &str) -> Result<u64, CoreError> {
        let files_snapshot: Vec<FileSnapshot> = self
            .storage
            .files(Some(node_id))?
            .into_iter()
            .map(|row| FileSnapshot {
                file_id: row.file_id,
                content_hash: row.content_hash,
                last_updated: row.last_updated,
            })
            .collect();
        let checkpoint = NodeCheckpoint {
            node_id: node_id.to_string(),
            timestamp: crate::unix_millis(),
            checkpoint_hash: snapshot_hash(&files_snapshot)?,
            files_snapshot,
        };

        let data = rmp_serde::to_vec_named(&checkpoint)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let id = self
            .storage
            .append_node_checkpoint(&data)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        debug!(
            node = %node_id,
            checkpoint_id = id,
            files = checkpoint.files_snapshot.len(),
            "Node checkpoint created"
        );
        Ok(id)
    }

    /// Checkpoint every listed node, then record them as one recovery line.
    pub fn create_coordinated_checkpoint(&self, nodes: &[String]) -> Result<u64, CoreError> {
        let participants: BTreeSet<&String> = nodes.iter().collect();
        let mut participating_nodes = Vec::with_capacity(participants.len());
        let mut node_checkpoints = Vec::with_capacity(participants.len());
        let mut total_files = 0;

        for node_id in participants {
            let id = self.create_node_checkpoint(node_id)?;
            total_files += self.node_checkpoint(id)?.files_snapshot.len();
            participating_nodes.push(node_id.clone());
            node_checkpoints.push(id);
        }

        let global = GlobalCheckpoint {
            timestamp: crate::unix_millis(),
            participating_nodes,
            node_checkpoints,
            total_files,
            valid_recovery_line: true,
        };
        let data = rmp_serde::to_vec_named(&global)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let id = self
            .storage
            .append_global_checkpoint(&data)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        info!(
            checkpoint_id = id,
            nodes = global.participating_nodes.len(),
            total_files,
            "Coordinated checkpoint created"
        );
        Ok(id)
    }

    /// Roll every participant back to the checkpointed rows.
    ///
    /// Fails without mutating anything if any participant's snapshot no
    /// longer matches its recorded hash.
    pub fn restore_from_checkpoint(&self, checkpoint_id: u64) -> Result<RestoreReport, CoreError> {
        let global = self.global_checkpoint(checkpoint_id)?;
        if !global.valid_recovery_line {
            return Err(CheckpointError::NotRecoveryLine(checkpoint_id).into());
        }

        let mut verified = Vec::with_capacity(global.node_checkpoints.len());
        for &node_checkpoint_id in &global.node_checkpoints {
            let checkpoint = self.load_node_checkpoint(node_checkpoint_id)?.ok_or(
                CheckpointError::MissingNodeCheckpoint {
                    checkpoint_id,
                    node_checkpoint_id,
                },
            )?;
            if !checkpoint.verify()? {
                warn!(
                    checkpoint_id,
                    node = %checkpoint.node_id,
                    "Checkpoint integrity check failed, restore aborted"
                );
                return Err(CheckpointError::CorruptCheckpoint {
                    checkpoint_id,
                    node_id: checkpoint.node_id,
                }
                .into());
            }
            verified.push(checkpoint);
        }

        let rows = verified
            .iter()
            .map(NodeCheckpoint::restored_rows)
            .collect::<Result<Vec<_>, _>>()?;
        self.storage
            .replace_file_meta(&rows)
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let report = RestoreReport {
            restored_nodes: verified.into_iter().map(|c| c.node_id).collect(),
            total_files: rows.iter().map(|(_, r)| r.len()).sum(),
        };
        info!(
            checkpoint_id,
            nodes = report.restored_nodes.len(),
            total_files = report.total_files,
            "Restored from checkpoint"
        );
        Ok(report)
    }

    /// All global checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<(u64, GlobalCheckpoint)>, CoreError> {
        self.storage
            .list_global_checkpoints()
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .into_iter()
            .map(|(id, data)| {
                rmp_serde::from_slice(&data)
                    .map(|checkpoint| (id, checkpoint))
                    .map_err(|e| CoreError::Deserialization(e.to_string()))
            })
            .collect()
    }

    pub fn latest_recovery_line(&self) -> Result<Option<(u64, GlobalCheckpoint)>, CoreError> {
        Ok(self
            .list_checkpoints()?
            .into_iter()
            .rev()
            .find(|(_, checkpoint)| checkpoint.valid_recovery_line))
    }

    pub fn global_checkpoint(&self, id: u64) -> Result<GlobalCheckpoint, CoreError> {
        let data = self
            .storage
            .get_global_checkpoint(id)
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .ok_or(CheckpointError::NotFound(id))?;
        rmp_serde::from_slice(&data).map_err(|e| CoreError::Deserialization(e.to_string()))
    }

    pub fn node_checkpoint(&self, id: u64) -> Result<NodeCheckpoint, CoreError> {
        self.load_node_checkpoint(id)?
            .ok_or_else(|| CheckpointError::NotFound(id).into())
    }

    fn load_node_checkpoint(&self, id: u64) -> Result<Option<NodeCheckpoint>, CoreError> {
        self.storage
            .get_node_checkpoint(id)
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .map(|data| {
                rmp_serde::from_slice(&data).map_err(|e| CoreError::Deserialization(e.to_string()))
            })
            .transpose()
    }
}

impl<T: Storage> std::fmt::Debug for CheckpointManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

// ============================================================================
// Scheduled maintenance
// ============================================================================

pub(crate) fn start_checkpoint_task<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
) -> JoinHandle<()> {
    let period = node.config.checkpoint_interval;

    tokio::spawn(async move {
        if period.is_zero() {
            debug!("Scheduled checkpoints disabled");
            return;
        }
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = node.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !node.election.is_coordinator().await {
                continue;
            }
            if let Err(e) = node.create_checkpoint().await {
                warn!(error = %e, "Scheduled checkpoint failed");
            }
        }
        debug!("Checkpoint task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RedbStorage, NODE_CHECKPOINTS};
    use tempfile::TempDir;

    fn setup() -> (CheckpointManager<RedbStorage>, Arc<RedbStorage>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(RedbStorage::open(dir.path().join("test.redb")).unwrap());
        (CheckpointManager::new(storage.clone()), storage, dir)
    }

    fn put(storage: &RedbStorage, node: &str, file: &str, hash: &str, at: u64) {
        storage
            .put_file(&FileRecord {
                node_id: node.to_string(),
                file_id: file.to_string(),
                content_hash: hash.to_string(),
                last_updated: Some(at),
                restored_from_checkpoint: false,
            })
            .unwrap();
    }

    fn snapshot(file: &str, hash: &str) -> FileSnapshot {
        FileSnapshot {
            file_id: file.to_string(),
            content_hash: hash.to_string(),
            last_updated: Some(1),
        }
    }

    #[test]
    fn test_hash_ignores_row_order() {
        let a = vec![snapshot("a", "h1"), snapshot("b", "h2")];
        let b = vec![snapshot("b", "h2"), snapshot("a", "h1")];
        assert_eq!(snapshot_hash(&a).unwrap(), snapshot_hash(&b).unwrap());
        assert_eq!(snapshot_hash(&a).unwrap().len(), 64);

        let changed = vec![snapshot("a", "h1"), snapshot("b", "h3")];
        assert_ne!(snapshot_hash(&a).unwrap(), snapshot_hash(&changed).unwrap());
    }

    #[test]
    fn test_restore_rolls_back_rows() {
        let (manager, storage, _dir) = setup();
        put(&storage, "n1", "f1", "h1", 10);
        put(&storage, "n2", "f1", "h1", 10);
        put(&storage, "n2", "f2", "h2", 11);

        let id = manager
            .create_coordinated_checkpoint(&["n2".to_string(), "n1".to_string()])
            .unwrap();
        let global = manager.global_checkpoint(id).unwrap();
        assert_eq!(global.participating_nodes, vec!["n1", "n2"]);
        assert_eq!(global.total_files, 3);
        assert!(global.valid_recovery_line);

        put(&storage, "n1", "f1", "h9", 20);
        put(&storage, "n1", "f3", "h3", 21);
        storage.remove_file("n2", "f2").unwrap();

        let report = manager.restore_from_checkpoint(id).unwrap();
        assert_eq!(report.restored_nodes, vec!["n1", "n2"]);
        assert_eq!(report.total_files, 3);

        let n1 = storage.files(Some("n1")).unwrap();
        assert_eq!(n1.len(), 1);
        assert_eq!(n1[0].content_hash, "h1");
        assert_eq!(n1[0].last_updated, Some(10));
        assert!(n1[0].restored_from_checkpoint);
        assert_eq!(storage.files(Some("n2")).unwrap().len(), 2);
    }

    #[test]
    fn test_tampered_checkpoint_is_rejected_without_mutation() {
        let (manager, storage, _dir) = setup();
        put(&storage, "n1", "f1", "h1", 10);
        let id = manager.create_coordinated_checkpoint(&["n1".to_string()]).unwrap();
        let node_checkpoint_id = manager.global_checkpoint(id).unwrap().node_checkpoints[0];

        let mut tampered = manager.node_checkpoint(node_checkpoint_id).unwrap();
        tampered.checkpoint_hash = "0".repeat(64);
        let data = rmp_serde::to_vec_named(&tampered).unwrap();
        let txn = storage.database().begin_write().unwrap();
        {
            let mut table = txn.open_table(NODE_CHECKPOINTS).unwrap();
            table.insert(node_checkpoint_id, data.as_slice()).unwrap();
        }
        txn.commit().unwrap();

        put(&storage, "n1", "f1", "h2", 20);
        let err = manager.restore_from_checkpoint(id).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Checkpoint(CheckpointError::CorruptCheckpoint { checkpoint_id, ref node_id })
                if checkpoint_id == id && node_id == "n1"
        ));

        let rows = storage.files(Some("n1")).unwrap();
        assert_eq!(rows[0].content_hash, "h2");
        assert!(!rows[0].restored_from_checkpoint);
    }

    #[test]
    fn test_unknown_checkpoint() {
        let (manager, _storage, _dir) = setup();
        assert!(matches!(
            manager.restore_from_checkpoint(42),
            Err(CoreError::Checkpoint(CheckpointError::NotFound(42)))
        ));
    }

    #[test]
    fn test_latest_recovery_line() {
        let (manager, storage, _dir) = setup();
        assert!(manager.latest_recovery_line().unwrap().is_none());

        put(&storage, "n1", "f1", "h1", 10);
        let first = manager.create_coordinated_checkpoint(&["n1".to_string()]).unwrap();
        let second = manager.create_coordinated_checkpoint(&["n1".to_string()]).unwrap();
        assert!(second > first);
        assert_eq!(manager.list_checkpoints().unwrap().len(), 2);
        assert_eq!(manager.latest_recovery_line().unwrap().unwrap().0, second);
    }

    #[test]
    fn test_empty_node_checkpoint_restores_to_empty() {
        let (manager, storage, _dir) = setup();
        let id = manager.create_coordinated_checkpoint(&["n1".to_string()]).unwrap();
        put(&storage, "n1", "late", "h1", 10);

        let report = manager.restore_from_checkpoint(id).unwrap();
        assert_eq!(report.total_files, 0);
        assert!(storage.files(Some("n1")).unwrap().is_empty());
    }
}
