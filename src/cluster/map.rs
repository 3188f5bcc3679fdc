//! Cluster Map
//!
//! Identifies partitions, storage nodes and the physical replicas placed on
//! them. The engine only reads this; placement decisions and failure
//! detection belong to the membership service.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::config::WolfSyncConfig;
use crate::error::{Error, Result};

/// Logical shard of the keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A storage node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataNodeId {
    pub host: String,
    pub port: u16,
    pub datacenter: String,
}

impl DataNodeId {
    pub fn new(host: impl Into<String>, port: u16, datacenter: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            datacenter: datacenter.into(),
        }
    }

    /// Parse a `host:port` address
    pub fn parse(address: &str, datacenter: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("address '{}' is not host:port", address)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port in address '{}'", address)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("missing host in address '{}'", address)));
        }
        Ok(Self::new(host, port, datacenter))
    }

    /// Network address of the node's replication listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check whether two nodes share a datacenter
    pub fn same_datacenter(&self, other: &DataNodeId) -> bool {
        self.datacenter == other.datacenter
    }
}

impl fmt::Display for DataNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One physical copy of a partition
///
/// Identity is `(partition, node, mount_path)`; capacity and the sealed flag
/// are attributes and do not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaId {
    partition: PartitionId,
    node: DataNodeId,
    mount_path: String,
    capacity_bytes: u64,
    sealed: bool,
}

impl ReplicaId {
    pub fn new(
        partition: PartitionId,
        node: DataNodeId,
        mount_path: impl Into<String>,
        capacity_bytes: u64,
        sealed: bool,
    ) -> Self {
        Self {
            partition,
            node,
            mount_path: mount_path.into(),
            capacity_bytes,
            sealed,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn node(&self) -> &DataNodeId {
        &self.node
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Sealed replicas accept no new client writes
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn identity(&self) -> (PartitionId, &DataNodeId, &str) {
        (self.partition, &self.node, &self.mount_path)
    }
}

impl PartialEq for ReplicaId {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ReplicaId {}

impl Hash for ReplicaId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for ReplicaId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReplicaId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node, self.mount_path, self.partition)
    }
}

/// Read-only view of partition placement
pub trait ClusterMap: Send + Sync {
    /// This node
    fn local_node(&self) -> &DataNodeId;

    /// Every replica of every partition
    fn replicas(&self) -> Vec<ReplicaId>;

    /// Replicas placed on this node
    fn local_replicas(&self) -> Vec<ReplicaId> {
        let local = self.local_node();
        self.replicas()
            .into_iter()
            .filter(|r| r.node() == local)
            .collect()
    }

    /// Replicas of the same partition as `local` placed on other nodes
    fn peer_replicas(&self, local: &ReplicaId) -> Vec<ReplicaId> {
        self.replicas()
            .into_iter()
            .filter(|r| r.partition() == local.partition() && r.node() != local.node())
            .collect()
    }

    /// Check whether this node hosts a replica of `partition`
    fn hosts(&self, partition: PartitionId) -> bool {
        self.local_replicas().iter().any(|r| r.partition() == partition)
    }
}

/// Cluster map fixed at construction, typically loaded from configuration
#[derive(Debug, Clone)]
pub struct StaticClusterMap {
    local_node: DataNodeId,
    replicas: Vec<ReplicaId>,
}

impl StaticClusterMap {
    pub fn new(local_node: DataNodeId, replicas: Vec<ReplicaId>) -> Self {
        Self { local_node, replicas }
    }

    /// Build the map from the `[[cluster.replicas]]` tables
    pub fn from_config(config: &WolfSyncConfig) -> Result<Self> {
        let local_node = config.local_node()?;
        let mut replicas = Vec::with_capacity(config.cluster.replicas.len());

        for entry in &config.cluster.replicas {
            let node = DataNodeId::parse(&entry.node, &entry.datacenter)?;
            let replica = ReplicaId::new(
                PartitionId(entry.partition),
                node,
                entry.mount_path.clone(),
                entry.capacity_bytes,
                entry.sealed,
            );
            if replicas.contains(&replica) {
                return Err(Error::Config(format!("duplicate replica {}", replica)));
            }
            replicas.push(replica);
        }

        Ok(Self::new(local_node, replicas))
    }
}

impl ClusterMap for StaticClusterMap {
    fn local_node(&self) -> &DataNodeId {
        &self.local_node
    }

    fn replicas(&self) -> Vec<ReplicaId> {
        self.replicas.clone()
    }
}
