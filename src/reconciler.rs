//! Periodic consistency reconciliation.
//!
//! A file whose replicas disagree on `content_hash` is a conflict. The
//! replica with the latest `last_updated` is canonical (ties go to the
//! smallest node id) and is pushed over every stale replica. Replicas
//! without a timestamp are never canonical. Nothing is ever deleted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::content::ContentTransport;
use crate::replication::ReplicationCoordinator;
use crate::storage::{FileMetadata, FileRecord, Storage};
use crate::{CoordinatorNode, CoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale replicas overwritten with the canonical content.
    pub files_synced: usize,
    pub conflicts_resolved: usize,
    /// Conflicts left as-is (no timestamped replica, or a push failed).
    pub unresolved: usize,
}

/// Replicas of one file that disagree on content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub file_id: String,
    pub replicas: Vec<FileRecord>,
}

/// Group rows by file and keep the files whose replicas disagree.
pub fn find_conflicts(rows: Vec<FileRecord>) -> Vec<Conflict> {
    let mut by_file: BTreeMap<String, Vec<FileRecord>> = BTreeMap::new();
    for row in rows {
        by_file.entry(row.file_id.clone()).or_default().push(row);
    }

    by_file
        .into_iter()
        .filter(|(_, replicas)| {
            replicas.len() > 1
                && replicas
                    .iter()
                    .map(|r| r.content_hash.as_str())
                    .collect::<BTreeSet<_>>()
                    .len()
                    > 1
        })
        .map(|(file_id, replicas)| Conflict { file_id, replicas })
        .collect()
}

/// Last-write-wins. Equal timestamps resolve to the smallest node id.
pub fn pick_canonical(replicas: &[FileRecord]) -> Option<&FileRecord> {
    replicas
        .iter()
        .filter(|r| r.last_updated.is_some())
        .max_by(|a, b| {
            a.last_updated
                .cmp(&b.last_updated)
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
}

pub struct Reconciler<T: Storage, C: ContentTransport> {
    storage: Arc<T>,
    replication: Arc<ReplicationCoordinator<T, C>>,
}

impl<T: Storage, C: ContentTransport> Reconciler<T, C> {
    pub fn new(storage: Arc<T>, replication: Arc<ReplicationCoordinator<T, C>>) -> Self {
        Self {
            storage,
            replication,
        }
    }

    /// One reconciliation pass: repair conflicts, then restart the missing
    /// targets of failed replication tasks.
    pub async fn reconcile(&self) -> Result<ReconcileReport, CoreError> {
        let mut report = ReconcileReport::default();
        let conflicts = find_conflicts(self.storage.files(None)?);

        for conflict in &conflicts {
            let Some(canonical) = pick_canonical(&conflict.replicas) else {
                warn!(file_id = %conflict.file_id, "Conflict without a timestamped replica, leaving as-is");
                report.unresolved += 1;
                continue;
            };

            let mut all_synced = true;
            for stale in conflict
                .replicas
                .iter()
                .filter(|r| r.content_hash != canonical.content_hash)
            {
                match self
                    .replication
                    .push_replica(&conflict.file_id, &canonical.node_id, &stale.node_id)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            file_id = %conflict.file_id,
                            from = %canonical.node_id,
                            to = %stale.node_id,
                            "Stale replica overwritten"
                        );
                        report.files_synced += 1;
                    }
                    Err(e) => {
                        warn!(file_id = %conflict.file_id, node = %stale.node_id, error = %e, "Failed to sync replica");
                        all_synced = false;
                    }
                }
            }

            if all_synced {
                report.conflicts_resolved += 1;
            } else {
                report.unresolved += 1;
            }
        }

        for task in self.replication.failed_tasks().await {
            if let Err(e) = self.replication.repair_failed(&task.doc_id).await {
                warn!(doc_id = %task.doc_id, error = %e, "Failed to schedule replication repair");
            }
        }

        if !conflicts.is_empty() {
            info!(
                conflicts = conflicts.len(),
                resolved = report.conflicts_resolved,
                synced = report.files_synced,
                unresolved = report.unresolved,
                "Reconciliation pass finished"
            );
        }
        Ok(report)
    }
}

pub(crate) fn start_reconciler_task<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
) -> JoinHandle<()> {
    let period = node.config.reconcile_interval;

    tokio::spawn(async move {
        if period.is_zero() {
            debug!("Reconciler disabled");
            return;
        }
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = node.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            // Single writer cluster-wide
            if !node.election.is_coordinator().await {
                continue;
            }
            if let Err(e) = node.reconciler.reconcile().await {
                warn!(error = %e, "Reconciliation pass failed");
            }
        }
        debug!("Reconciler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(node: &str, file: &str, hash: &str, at: Option<u64>) -> FileRecord {
        FileRecord {
            node_id: node.to_string(),
            file_id: file.to_string(),
            content_hash: hash.to_string(),
            last_updated: at,
            restored_from_checkpoint: false,
        }
    }

    #[test]
    fn test_only_disagreeing_files_conflict() {
        let rows = vec![
            row("a", "same", "h1", Some(1)),
            row("b", "same", "h1", Some(2)),
            row("a", "single", "h1", Some(1)),
            row("a", "split", "h1", Some(1)),
            row("b", "split", "h2", Some(2)),
        ];
        let conflicts = find_conflicts(rows);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].file_id, "split");
    }

    #[test]
    fn test_latest_write_is_canonical() {
        let replicas = vec![
            row("a", "f", "h1", Some(10)),
            row("b", "f", "h1", Some(10)),
            row("c", "f", "h2", Some(20)),
        ];
        assert_eq!(pick_canonical(&replicas).unwrap().node_id, "c");
    }

    #[test]
    fn test_timestamp_tie_goes_to_smallest_node_id() {
        let replicas = vec![
            row("c", "f", "h3", Some(10)),
            row("b", "f", "h2", Some(10)),
            row("d", "f", "h1", Some(5)),
        ];
        assert_eq!(pick_canonical(&replicas).unwrap().node_id, "b");
    }

    #[test]
    fn test_untimestamped_replicas_never_win() {
        let replicas = vec![row("a", "f", "h1", None), row("b", "f", "h2", Some(1))];
        assert_eq!(pick_canonical(&replicas).unwrap().node_id, "b");

        let all_null = vec![row("a", "f", "h1", None), row("b", "f", "h2", None)];
        assert!(pick_canonical(&all_null).is_none());
    }
}
