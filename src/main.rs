//! `docweave-node`: runs one coordination node configured from `DOCWEAVE_*`
//! environment variables.

use std::collections::HashMap;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use docweave::{Config, CoordinatorNode, HttpContentTransport, RedbStorage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let db_path = std::env::var("DOCWEAVE_DB_PATH")
        .unwrap_or_else(|_| format!("docweave-{}.redb", config.node_id));
    let storage = RedbStorage::open(&db_path)
        .with_context(|| format!("failed to open database at {db_path}"))?;

    let endpoints = match std::env::var("DOCWEAVE_CONTENT_ENDPOINTS") {
        Ok(raw) => HttpContentTransport::parse_endpoints(&raw)
            .context("invalid DOCWEAVE_CONTENT_ENDPOINTS")?,
        Err(_) => HashMap::new(),
    };
    let content = HttpContentTransport::new(endpoints, config.request_timeout);

    let node = CoordinatorNode::new(config, storage, content)?;
    let handles = node.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");

    node.shutdown().await?;
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
