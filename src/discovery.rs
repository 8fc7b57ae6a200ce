//! Pluggable peer discovery strategies.
//!
//! - **DNS**: Resolves a DNS name to candidate addresses (Docker Compose +
//!   Kubernetes). Node ids are learned with a `DISCOVERY_REQUEST` exchange.
//! - **Static**: Uses a fixed `id@host:port` peer list from configuration. A
//!   trailing `!` on the id marks a peer that may never become master.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, PeerConfig};
use crate::content::ContentTransport;
use crate::rpc::{DiscoveryRequest, Header, PeerMessage};
use crate::storage::Storage;
use crate::CoordinatorNode;

/// A peer found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Identity already known from configuration.
    Known(PeerConfig),
    /// Only the cluster address is known.
    Address(SocketAddr),
}

/// Peer discovery strategy.
pub enum Discovery {
    Dns(DnsPoll),
    Static(StaticList),
}

impl Discovery {
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.is_single_node() {
            return None;
        }

        if let Some(ref dns_name) = config.discovery.dns_name {
            Some(Discovery::Dns(DnsPoll::new(
                dns_name.clone(),
                config.cluster_port,
            )))
        } else if !config.discovery.peers.is_empty() {
            Some(Discovery::Static(StaticList::new(
                config.discovery.peers.clone(),
            )))
        } else {
            None
        }
    }

    /// Discover current cluster peers.
    pub async fn discover_peers(&self) -> anyhow::Result<Vec<Candidate>> {
        match self {
            Discovery::Dns(d) => d.discover().await,
            Discovery::Static(d) => Ok(d.discover()),
        }
    }
}

/// DNS-based peer discovery.
pub struct DnsPoll {
    dns_name: String,
    local_ip: Option<IpAddr>,
    port: u16,
}

impl DnsPoll {
    pub fn new(dns_name: String, port: u16) -> Self {
        let local_ip = detect_local_ip();
        if let Some(ip) = local_ip {
            info!(%ip, dns_name = %dns_name, port, "DNS discovery initialized");
        } else {
            warn!(dns_name = %dns_name, port, "DNS discovery initialized (could not detect local IP)");
        }
        Self {
            dns_name,
            port,
            local_ip,
        }
    }

    async fn discover(&self) -> anyhow::Result<Vec<Candidate>> {
        let lookup = format!("{}:{}", self.dns_name, self.port);

        let addrs: Vec<Candidate> = tokio::net::lookup_host(&lookup)
            .await?
            .filter(|addr| self.local_ip.map_or(true, |local| addr.ip() != local))
            .map(Candidate::Address)
            .collect();

        trace!(
            dns = %self.dns_name,
            peers = addrs.len(),
            "DNS discovery completed"
        );

        Ok(addrs)
    }
}

/// Static peer list discovery.
pub struct StaticList {
    peers: Vec<PeerConfig>,
}

impl StaticList {
    pub fn new(peers: Vec<PeerConfig>) -> Self {
        Self { peers }
    }

    fn discover(&self) -> Vec<Candidate> {
        self.peers.iter().cloned().map(Candidate::Known).collect()
    }
}

/// Detect the local IP address of this node.
pub fn detect_local_ip() -> Option<IpAddr> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if let Ok(addrs) = (hostname.as_str(), 0u16).to_socket_addrs() {
            for addr in addrs {
                if !addr.ip().is_loopback() {
                    return Some(addr.ip());
                }
            }
        }
    }

    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Compute the cluster TCP address for this node.
///
/// Uses `detect_local_ip` to find the routable IP and combines it
/// with the given cluster port. Falls back to `0.0.0.0` if detection fails.
pub(crate) fn compute_cluster_address(cluster_port: u16) -> String {
    if let Some(ip) = detect_local_ip() {
        format!("{ip}:{cluster_port}")
    } else {
        format!("0.0.0.0:{cluster_port}")
    }
}

// ============================================================================
// Discovery task
// ============================================================================

pub(crate) fn start_discovery_task<T: Storage, C: ContentTransport>(
    node: Arc<CoordinatorNode<T, C>>,
    discovery: Discovery,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = node.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match discovery.discover_peers().await {
                Ok(candidates) => admit_candidates(&node, candidates).await,
                Err(e) => {
                    warn!(error = %e, "Peer discovery failed");
                }
            }
        }
        debug!("Discovery task stopped");
    })
}

async fn admit_candidates<T: Storage, C: ContentTransport>(
    node: &CoordinatorNode<T, C>,
    candidates: Vec<Candidate>,
) {
    let known: HashSet<String> = node
        .detector
        .entries()
        .await
        .into_iter()
        .map(|entry| entry.address)
        .collect();

    for candidate in candidates {
        match candidate {
            Candidate::Known(peer) => {
                if peer.node_id != node.config.node_id {
                    node.remember_peer(&peer.node_id, &peer.address, peer.can_be_master)
                        .await;
                }
            }
            Candidate::Address(addr) => {
                let address = addr.to_string();
                if known.contains(&address) || address == node.advertise_address {
                    continue;
                }
                introduce(node, &address).await;
            }
        }
    }
}

/// Ask an unidentified address who it is.
async fn introduce<T: Storage, C: ContentTransport>(node: &CoordinatorNode<T, C>, address: &str) {
    let request = PeerMessage::DiscoveryRequest(DiscoveryRequest {
        header: Header::now(&node.config.node_id),
        address: node.advertise_address.clone(),
        can_be_master: node.config.can_be_master,
    });

    match node.transport.send(address, request).await {
        Ok(PeerMessage::Announce(announce)) => {
            if announce.header.sender_id != node.config.node_id {
                node.remember_peer(
                    &announce.header.sender_id,
                    &announce.address,
                    announce.can_be_master,
                )
                .await;
            }
        }
        Ok(other) => {
            warn!(address = %address, kind = ?other.message_type(), "Unexpected discovery response");
        }
        Err(e) => {
            trace!(address = %address, error = %e, "Discovery request failed");
            node.transport.disconnect(address).await;
        }
    }
}
