//! WolfSync Configuration
//!
//! This module provides configuration structures for the WolfSync
//! replication engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::DataNodeId;

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Replication pool policies
    #[serde(default)]
    pub replication: ReplicationSection,

    /// Token checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Static cluster map
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Status API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for the replication listener
    pub bind_address: String,

    /// Advertised address other nodes use to reach this one; must match
    /// this node's entries in the cluster map
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Datacenter this node lives in
    pub datacenter: String,

    /// Data directory for checkpoint storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Intra-colo and inter-colo pool policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    /// Pool replicating from peers in the same datacenter
    #[serde(default = "PoolConfig::intra_colo")]
    pub intra_colo: PoolConfig,

    /// Pool replicating from peers in other datacenters
    #[serde(default = "PoolConfig::inter_colo")]
    pub inter_colo: PoolConfig,
}

/// Policy for one replica thread pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of replica threads (0 = auto-tune from CPU cores)
    #[serde(default)]
    pub threads: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum entries returned by one metadata exchange
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    /// Maximum entry bytes described by one metadata exchange
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,

    /// Sleep after a round that made no progress, in milliseconds
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,

    /// Pause between two peers within a round, in milliseconds
    #[serde(default)]
    pub peer_pacing_ms: u64,

    /// First retry delay after a failed cycle, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Ceiling for the retry delay, in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Token checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Interval between token checkpoints in milliseconds
    #[serde(default = "default_checkpoint_interval_ms")]
    pub interval_ms: u64,

    /// How long shutdown waits for replica threads, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Static cluster map configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Every replica of every partition, including this node's
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,
}

/// One `[[cluster.replicas]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Partition the replica belongs to
    pub partition: u64,

    /// Node hosting the replica (host:port)
    pub node: String,

    /// Datacenter of the hosting node
    pub datacenter: String,

    /// Mount path of the replica on its node
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// Replica capacity in bytes
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,

    /// Whether the replica is sealed (read-only)
    #[serde(default)]
    pub sealed: bool,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_batch_entries() -> usize {
    100
}

fn default_max_batch_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_round_interval_ms() -> u64 {
    500
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_checkpoint_interval_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_mount_path() -> String {
    "/mnt0".to_string()
}

fn default_capacity_bytes() -> u64 {
    1024 * 1024 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfsync")
}

impl PoolConfig {
    /// Defaults for replication within a datacenter
    pub fn intra_colo() -> Self {
        Self {
            threads: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_batch_entries: default_max_batch_entries(),
            max_batch_bytes: default_max_batch_bytes(),
            round_interval_ms: default_round_interval_ms(),
            peer_pacing_ms: 0,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }

    /// Defaults for replication across datacenters: looser timeouts,
    /// slower retries
    pub fn inter_colo() -> Self {
        Self {
            threads: 0,
            connect_timeout_ms: 5000,
            request_timeout_ms: 15_000,
            max_batch_entries: default_max_batch_entries(),
            max_batch_bytes: default_max_batch_bytes(),
            round_interval_ms: 1000,
            peer_pacing_ms: 0,
            backoff_base_ms: 1000,
            backoff_max_ms: 120_000,
        }
    }

    fn validate(&self, name: &str) -> crate::Result<()> {
        if self.max_batch_entries == 0 {
            return Err(crate::Error::Config(format!(
                "replication.{}.max_batch_entries must be greater than 0",
                name
            )));
        }
        if self.max_batch_bytes == 0 {
            return Err(crate::Error::Config(format!(
                "replication.{}.max_batch_bytes must be greater than 0",
                name
            )));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(crate::Error::Config(format!(
                "replication.{} timeouts must be greater than 0",
                name
            )));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(crate::Error::Config(format!(
                "replication.{}.backoff_base_ms must be in 1..=backoff_max_ms",
                name
            )));
        }
        Ok(())
    }
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            intra_colo: PoolConfig::intra_colo(),
            inter_colo: PoolConfig::inter_colo(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_checkpoint_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfSyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.node.datacenter.is_empty() {
            return Err(crate::Error::Config("node.datacenter cannot be empty".into()));
        }

        if self.checkpoint.interval_ms == 0 {
            return Err(crate::Error::Config(
                "checkpoint.interval_ms must be greater than 0".into(),
            ));
        }

        self.replication.intra_colo.validate("intra_colo")?;
        self.replication.inter_colo.validate("inter_colo")?;

        // Surfaces malformed addresses at load time rather than at start
        self.local_node()?;
        for replica in &self.cluster.replicas {
            DataNodeId::parse(&replica.node, &replica.datacenter)?;
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Identity of this node in the cluster map
    pub fn local_node(&self) -> crate::Result<DataNodeId> {
        DataNodeId::parse(self.advertise_address(), &self.node.datacenter)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the checkpoint directory path
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.node.data_dir.join("checkpoint")
    }

    /// Get checkpoint interval as Duration
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint.interval_ms)
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.checkpoint.shutdown_grace_ms)
    }

    /// Sample configuration written by `wolfsync init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"[node]
id = "{node_id}"
bind_address = "0.0.0.0:7654"
advertise_address = "{node_id}:7654"
datacenter = "dc1"
data_dir = "/var/lib/wolfsync"

[replication.intra_colo]
threads = 0
request_timeout_ms = 5000
max_batch_entries = 100

[replication.inter_colo]
threads = 0
request_timeout_ms = 15000
backoff_max_ms = 120000

[checkpoint]
interval_ms = 30000
shutdown_grace_ms = 10000

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"

[[cluster.replicas]]
partition = 1
node = "{node_id}:7654"
datacenter = "dc1"

[[cluster.replicas]]
partition = 1
node = "node-2:7654"
datacenter = "dc1"

[[cluster.replicas]]
partition = 1
node = "node-3:7654"
datacenter = "dc2"
"#
        )
    }
}
