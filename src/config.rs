//! Node configuration.
//!
//! [`Config`] can be built by hand (every field has a default) or loaded from
//! `DOCWEAVE_*` environment variables with [`Config::from_env`].

use std::time::Duration;

use thiserror::Error;

/// Which tie-break strategy the election component runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMode {
    /// Highest eligible node id wins.
    Bully,
    /// First valid proof-of-work claim accepted for a term wins.
    ProofOfWork,
}

/// A statically configured peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: String,
    /// Cluster TCP address (`host:port`).
    pub address: String,
    pub can_be_master: bool,
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique node identifier. Ordering of ids is the Bully priority order.
    pub node_id: String,
    /// TCP port for inter-node cluster communication.
    pub cluster_port: u16,
    /// Address other nodes use to reach this node. Derived from the local IP
    /// and `cluster_port` when unset.
    pub advertise_address: Option<String>,
    /// Whether this node may become master.
    pub can_be_master: bool,
    /// Master to seed at startup instead of running an election.
    pub initial_master: Option<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub election: ElectionConfig,
    pub mutex: MutexConfig,
    pub replication: ReplicationConfig,
    pub reconcile_interval: Duration,
    /// Zero disables scheduled coordinated checkpoints.
    pub checkpoint_interval: Duration,
    /// Embedding dimension accepted by the location index.
    pub embedding_dim: usize,
    /// Per-request timeout on the peer transport.
    pub request_timeout: Duration,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub mode: ElectionMode,
    /// How long a candidate waits for ALIVE/COORDINATOR before retrying.
    pub timeout: Duration,
    /// Leading zero bits required by the proof-of-work puzzle.
    pub pow_difficulty: u32,
}

#[derive(Debug, Clone)]
pub struct MutexConfig {
    pub acquire_timeout: Duration,
    /// Replies required to enter the critical section. `None` means every
    /// non-offline peer.
    pub quorum: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub factor: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
}

/// Peer discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// DNS name to resolve for peer discovery (e.g., a Kubernetes headless service).
    /// Peers are resolved at the `cluster_port`.
    pub dns_name: Option<String>,
    /// Statically known peers.
    pub peers: Vec<PeerConfig>,
    /// How often to poll for peer changes.
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dns_name: None,
            peers: Vec::new(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            mode: ElectionMode::Bully,
            timeout: Duration::from_secs(5),
            pow_difficulty: 16,
        }
    }
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            quorum: None,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: 2,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            cluster_port: 9993,
            advertise_address: None,
            can_be_master: true,
            initial_master: None,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            election: ElectionConfig::default(),
            mutex: MutexConfig::default(),
            replication: ReplicationConfig::default(),
            reconcile_interval: Duration::from_secs(60),
            checkpoint_interval: Duration::ZERO,
            embedding_dim: 128,
            request_timeout: Duration::from_secs(5),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Errors produced while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("Missing required setting {0}")]
    Missing(&'static str),
}

impl Config {
    /// Returns true if no peers or DNS discovery is configured.
    pub fn is_single_node(&self) -> bool {
        self.discovery.peers.is_empty() && self.discovery.dns_name.is_none()
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        config.node_id = lookup("DOCWEAVE_NODE_ID").ok_or(ConfigError::Missing("DOCWEAVE_NODE_ID"))?;
        if let Some(v) = lookup("DOCWEAVE_CLUSTER_PORT") {
            config.cluster_port = parse("DOCWEAVE_CLUSTER_PORT", &v)?;
        }
        config.advertise_address = lookup("DOCWEAVE_ADVERTISE_ADDR");
        if let Some(v) = lookup("DOCWEAVE_CAN_BE_MASTER") {
            config.can_be_master = parse_bool("DOCWEAVE_CAN_BE_MASTER", &v)?;
        }
        config.initial_master = lookup("DOCWEAVE_INITIAL_MASTER").filter(|v| !v.is_empty());

        if let Some(v) = lookup("DOCWEAVE_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = secs("DOCWEAVE_HEARTBEAT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout = secs("DOCWEAVE_HEARTBEAT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_ELECTION_TIMEOUT_SECS") {
            config.election.timeout = secs("DOCWEAVE_ELECTION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_ELECTION_STRATEGY") {
            config.election.mode = match v.to_ascii_lowercase().as_str() {
                "bully" => ElectionMode::Bully,
                "pow" | "proof-of-work" => ElectionMode::ProofOfWork,
                _ => return Err(invalid("DOCWEAVE_ELECTION_STRATEGY", &v)),
            };
        }
        if let Some(v) = lookup("DOCWEAVE_POW_DIFFICULTY") {
            let difficulty: u32 = parse("DOCWEAVE_POW_DIFFICULTY", &v)?;
            if difficulty > crate::pow::MAX_DIFFICULTY {
                return Err(invalid("DOCWEAVE_POW_DIFFICULTY", &v));
            }
            config.election.pow_difficulty = difficulty;
        }
        if let Some(v) = lookup("DOCWEAVE_MUTEX_TIMEOUT_SECS") {
            config.mutex.acquire_timeout = secs("DOCWEAVE_MUTEX_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_MUTEX_QUORUM") {
            config.mutex.quorum = Some(parse("DOCWEAVE_MUTEX_QUORUM", &v)?);
        }
        if let Some(v) = lookup("DOCWEAVE_REPLICATION_FACTOR") {
            config.replication.factor = parse("DOCWEAVE_REPLICATION_FACTOR", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_RETRY_ATTEMPTS") {
            config.replication.retry_attempts = parse("DOCWEAVE_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_RETRY_BASE_MS") {
            config.replication.retry_base_delay =
                Duration::from_millis(parse("DOCWEAVE_RETRY_BASE_MS", &v)?);
        }
        if let Some(v) = lookup("DOCWEAVE_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval = secs("DOCWEAVE_RECONCILE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_CHECKPOINT_INTERVAL_SECS") {
            config.checkpoint_interval = secs("DOCWEAVE_CHECKPOINT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DOCWEAVE_EMBEDDING_DIM") {
            config.embedding_dim = parse("DOCWEAVE_EMBEDDING_DIM", &v)?;
        }
        config.discovery.dns_name = lookup("DOCWEAVE_DNS_NAME").filter(|v| !v.is_empty());
        if let Some(v) = lookup("DOCWEAVE_PEERS") {
            config.discovery.peers = parse_peers(&v)?;
        }

        Ok(config)
    }
}

/// Parse `id@host:port[,id@host:port...]`. A trailing `!` on the id marks the
/// peer as never eligible for mastership (`worker-3!@10.0.0.3:9993`).
pub fn parse_peers(raw: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, address) = entry
                .split_once('@')
                .ok_or_else(|| invalid("DOCWEAVE_PEERS", entry))?;
            if address.is_empty() || id.is_empty() {
                return Err(invalid("DOCWEAVE_PEERS", entry));
            }
            let (node_id, can_be_master) = match id.strip_suffix('!') {
                Some(id) => (id, false),
                None => (id, true),
            };
            Ok(PeerConfig {
                node_id: node_id.to_string(),
                address: address.to_string(),
                can_be_master,
            })
        })
        .collect()
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<V: std::str::FromStr>(key: &str, value: &str) -> Result<V, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse(key, value)?))
}
