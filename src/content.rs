//! Document content fetch/push collaborator.
//!
//! Replication moves bytes between nodes through this interface; the core
//! never interprets the content.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::bytes::Bytes;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("No content endpoint known for node {0}")]
    UnknownNode(String),
    #[error("Document {doc_id} not found on node {node_id}")]
    NotFound { node_id: String, doc_id: String },
    #[error("Node {node_id} answered {status}")]
    Status { node_id: String, status: u16 },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Content transport error: {0}")]
    Other(String),
}

/// Moves document content between nodes.
#[async_trait]
pub trait ContentTransport: Send + Sync + 'static {
    /// Download `doc_id` from `node_id`.
    async fn fetch(&self, node_id: &str, doc_id: &str) -> Result<Bytes, ContentError>;

    /// Upload `content` for `doc_id` to `node_id`, overwriting any copy there.
    async fn push(&self, node_id: &str, doc_id: &str, content: Bytes) -> Result<(), ContentError>;
}

/// HTTP implementation: `GET`/`POST {base}/files/{doc_id}/content`.
#[derive(Debug, Clone)]
pub struct HttpContentTransport {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
    timeout: Duration,
}

impl HttpContentTransport {
    pub fn new(endpoints: HashMap<String, String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            timeout,
        }
    }

    /// Parse `id=http://host:port,id2=...`.
    pub fn parse_endpoints(raw: &str) -> Result<HashMap<String, String>, ContentError> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .split_once('=')
                    .filter(|(id, url)| !id.is_empty() && !url.is_empty())
                    .map(|(id, url)| (id.to_string(), url.trim_end_matches('/').to_string()))
                    .ok_or_else(|| ContentError::Other(format!("Invalid endpoint entry: {entry}")))
            })
            .collect()
    }

    fn url(&self, node_id: &str, doc_id: &str) -> Result<String, ContentError> {
        let base = self
            .endpoints
            .get(node_id)
            .ok_or_else(|| ContentError::UnknownNode(node_id.to_string()))?;
        Ok(format!("{base}/files/{doc_id}/content"))
    }
}

#[async_trait]
impl ContentTransport for HttpContentTransport {
    async fn fetch(&self, node_id: &str, doc_id: &str) -> Result<Bytes, ContentError> {
        let url = self.url(node_id, doc_id)?;
        trace!(node = %node_id, doc_id = %doc_id, "Fetching content");

        let response = self.client.get(url).timeout(self.timeout).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ContentError::NotFound {
                node_id: node_id.to_string(),
                doc_id: doc_id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ContentError::Status {
                node_id: node_id.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await?)
    }

    async fn push(&self, node_id: &str, doc_id: &str, content: Bytes) -> Result<(), ContentError> {
        let url = self.url(node_id, doc_id)?;
        trace!(node = %node_id, doc_id = %doc_id, bytes = content.len(), "Pushing content");

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .body(content)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ContentError::Status {
                node_id: node_id.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
