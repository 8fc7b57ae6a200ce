//! Semantic location index.
//!
//! Keeps one embedding per document plus a running-mean centroid per node,
//! and answers affinity queries over them with a linear cosine scan. The
//! index holds cluster metadata only, so a scan stays cheap.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Unknown document: {0}")]
    UnknownDocument(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub filename: String,
    pub node_id: String,
    pub embedding: Vec<f32>,
}

/// Aggregate embedding of the documents hosted by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub node_id: String,
    pub centroid: Vec<f32>,
    pub document_count: usize,
}

impl NodeProfile {
    fn empty(node_id: &str, dim: usize) -> Self {
        Self {
            node_id: node_id.to_string(),
            centroid: vec![0.0; dim],
            document_count: 0,
        }
    }

    /// Fold one embedding into the running mean.
    fn absorb(&mut self, embedding: &[f32]) {
        self.document_count += 1;
        let n = self.document_count as f32;
        for (c, v) in self.centroid.iter_mut().zip(embedding) {
            *c += (v - *c) / n;
        }
    }
}

#[derive(Debug, Default)]
struct IndexInner {
    documents: HashMap<String, DocumentRecord>,
    profiles: HashMap<String, NodeProfile>,
}

impl IndexInner {
    /// Drop a document. The node centroid keeps the removed contribution.
    fn remove(&mut self, doc_id: &str) -> Option<DocumentRecord> {
        let record = self.documents.remove(doc_id)?;
        if let Some(profile) = self.profiles.get_mut(&record.node_id) {
            profile.document_count = profile.document_count.saturating_sub(1);
            if profile.document_count == 0 {
                self.profiles.remove(&record.node_id);
            }
        }
        Some(record)
    }
}

/// Document and node-profile embeddings for the whole cluster.
#[derive(Debug)]
pub struct LocationIndex {
    dim: usize,
    inner: RwLock<IndexInner>,
}

impl LocationIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    /// Store a document and fold its embedding into its node's profile.
    /// Re-registering a `doc_id` replaces the previous record.
    pub async fn register_document(
        &self,
        doc_id: &str,
        filename: &str,
        node_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        self.check_dim(&embedding)?;

        let mut inner = self.inner.write().await;
        inner.remove(doc_id);
        inner
            .profiles
            .entry(node_id.to_string())
            .or_insert_with(|| NodeProfile::empty(node_id, self.dim))
            .absorb(&embedding);
        inner.documents.insert(
            doc_id.to_string(),
            DocumentRecord {
                doc_id: doc_id.to_string(),
                filename: filename.to_string(),
                node_id: node_id.to_string(),
                embedding,
            },
        );
        debug!(doc_id = %doc_id, node = %node_id, "Registered document");
        Ok(())
    }

    pub async fn remove_document(&self, doc_id: &str) -> Result<DocumentRecord, IndexError> {
        self.inner
            .write()
            .await
            .remove(doc_id)
            .ok_or_else(|| IndexError::UnknownDocument(doc_id.to_string()))
    }

    /// Top-k documents by cosine similarity, best first, optionally
    /// restricted to documents hosted on `node_filter`.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        node_filter: Option<&[String]>,
    ) -> Result<Vec<(String, f32)>, IndexError> {
        self.check_dim(query)?;

        let inner = self.inner.read().await;
        let scored = inner
            .documents
            .values()
            .filter(|d| node_filter.map_or(true, |nodes| nodes.contains(&d.node_id)))
            .map(|d| (d.doc_id.clone(), cosine_similarity(query, &d.embedding)))
            .collect();
        Ok(top_k_by_score(scored, top_k))
    }

    /// Nodes whose content profile is closest to the query, best first.
    pub async fn find_nodes_for_query(
        &self,
        query: &[f32],
        max_nodes: usize,
    ) -> Result<Vec<(String, f32)>, IndexError> {
        self.check_dim(query)?;

        let inner = self.inner.read().await;
        let scored = inner
            .profiles
            .values()
            .map(|p| (p.node_id.clone(), cosine_similarity(query, &p.centroid)))
            .collect();
        Ok(top_k_by_score(scored, max_nodes))
    }

    /// Rank every node other than `source_node` by centroid affinity to the
    /// document and return the best `replication_factor`.
    pub async fn select_replica_nodes(
        &self,
        source_node: &str,
        document_embedding: &[f32],
        replication_factor: usize,
    ) -> Result<Vec<String>, IndexError> {
        self.select_replica_nodes_excluding(source_node, document_embedding, replication_factor, &[])
            .await
    }

    /// Like [`select_replica_nodes`](Self::select_replica_nodes) but also
    /// skips `exclude` (e.g. nodes known to be offline).
    pub async fn select_replica_nodes_excluding(
        &self,
        source_node: &str,
        document_embedding: &[f32],
        replication_factor: usize,
        exclude: &[String],
    ) -> Result<Vec<String>, IndexError> {
        self.check_dim(document_embedding)?;

        let inner = self.inner.read().await;
        let scored = inner
            .profiles
            .values()
            .filter(|p| p.node_id != source_node && !exclude.contains(&p.node_id))
            .map(|p| (p.node_id.clone(), cosine_similarity(document_embedding, &p.centroid)))
            .collect();
        Ok(top_k_by_score(scored, replication_factor)
            .into_iter()
            .map(|(node, _)| node)
            .collect())
    }

    pub async fn document(&self, doc_id: &str) -> Option<DocumentRecord> {
        self.inner.read().await.documents.get(doc_id).cloned()
    }

    pub async fn node_profile(&self, node_id: &str) -> Option<NodeProfile> {
        self.inner.read().await.profiles.get(node_id).cloned()
    }

    pub async fn node_profiles(&self) -> Vec<NodeProfile> {
        let mut profiles: Vec<_> = self.inner.read().await.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        profiles
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// Sort by score descending (id ascending on ties) and keep `k`.
fn top_k_by_score(mut scored: Vec<(String, f32)>, k: usize) -> Vec<(String, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index_with_docs() -> LocationIndex {
        let index = LocationIndex::new(3);
        index.register_document("d1", "a.txt", "n1", vec![1.0, 0.0, 0.0]).await.unwrap();
        index.register_document("d2", "b.txt", "n1", vec![0.8, 0.2, 0.0]).await.unwrap();
        index.register_document("d3", "c.txt", "n2", vec![0.0, 1.0, 0.0]).await.unwrap();
        index.register_document("d4", "d.txt", "n3", vec![0.0, 0.0, 1.0]).await.unwrap();
        index
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_does_not_mutate() {
        let index = index_with_docs().await;
        let before = index.node_profiles().await;

        let err = index
            .register_document("d9", "x.txt", "n1", vec![1.0, 0.0])
            .await
            .unwrap_err();
        assert_eq!(err, IndexError::DimensionMismatch { expected: 3, actual: 2 });
        assert_eq!(index.len().await, 4);
        assert!(index.document("d9").await.is_none());
        assert_eq!(index.node_profiles().await, before);
    }

    #[tokio::test]
    async fn test_centroid_is_running_mean() {
        let index = index_with_docs().await;
        let profile = index.node_profile("n1").await.unwrap();
        assert_eq!(profile.document_count, 2);
        assert!((profile.centroid[0] - 0.9).abs() < 1e-6);
        assert!((profile.centroid[1] - 0.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_search_orders_by_score_and_filters() {
        let index = index_with_docs().await;

        let hits = index.search(&[1.0, 0.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "d1");
        assert_eq!(hits[1].0, "d2");
        assert!(hits[0].1 >= hits[1].1);

        let only_n2 = ["n2".to_string()];
        let hits = index.search(&[1.0, 0.0, 0.0], 10, Some(&only_n2)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "d3");
    }

    #[tokio::test]
    async fn test_find_nodes_for_query() {
        let index = index_with_docs().await;
        let nodes = index.find_nodes_for_query(&[0.0, 1.0, 0.1], 2).await.unwrap();
        assert_eq!(nodes[0].0, "n2");
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_select_replica_nodes_excludes_source() {
        let index = index_with_docs().await;

        let targets = index.select_replica_nodes("n1", &[0.0, 0.9, 0.1], 2).await.unwrap();
        assert_eq!(targets, vec!["n2".to_string(), "n3".to_string()]);

        let targets = index
            .select_replica_nodes_excluding("n1", &[0.0, 0.9, 0.1], 2, &["n2".to_string()])
            .await
            .unwrap();
        assert_eq!(targets, vec!["n3".to_string()]);

        let single = LocationIndex::new(3);
        single.register_document("d1", "a", "solo", vec![1.0, 0.0, 0.0]).await.unwrap();
        assert!(single.select_replica_nodes("solo", &[1.0, 0.0, 0.0], 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_keeps_centroid_and_drops_empty_profile() {
        let index = index_with_docs().await;
        let before = index.node_profile("n1").await.unwrap();

        index.remove_document("d2").await.unwrap();
        let after = index.node_profile("n1").await.unwrap();
        assert_eq!(after.document_count, 1);
        assert_eq!(after.centroid, before.centroid);

        index.remove_document("d4").await.unwrap();
        assert!(index.node_profile("n3").await.is_none());

        assert_eq!(
            index.remove_document("d4").await.unwrap_err(),
            IndexError::UnknownDocument("d4".into())
        );
    }

    #[tokio::test]
    async fn test_reregister_moves_document() {
        let index = index_with_docs().await;
        index.register_document("d3", "c.txt", "n3", vec![0.0, 0.0, 1.0]).await.unwrap();
        assert_eq!(index.document("d3").await.unwrap().node_id, "n3");
        assert!(index.node_profile("n2").await.is_none());
        assert_eq!(index.node_profile("n3").await.unwrap().document_count, 2);
        assert_eq!(index.len().await, 4);
    }
}
