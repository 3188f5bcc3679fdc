//! Replication Module
//!
//! Pull-based replication of partition replicas from their peers: tokens,
//! per-peer state, replica threads and their pools, group assignment,
//! token checkpointing and metrics.

pub mod protocol;
mod token;
mod remote_replica;
mod backoff;
mod thread;
mod group;
mod metrics;
mod checkpoint;
mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{BatchLimits, ErrorCode, FrameHeader, Message, MetadataBatch};
pub use token::{Token, TokenCell};
pub use remote_replica::{
    RemoteReplicaInfo, RemoteReplicaStatus, ReplicaKey, ReplicaRegistry, ReplicaState,
};
pub use backoff::Backoff;
pub use thread::{CycleOutcome, ReplicaThread, ReplicaThreadPool, WorkerLifecycle, WorkerState};
pub use group::ReplicationGroup;
pub use metrics::{LatencySummary, MetricsSnapshot, ReplicationMetrics};
pub use checkpoint::{CheckpointManager, CheckpointRecord, CheckpointStore};
pub use manager::{ManagerSettings, ReplicationManager};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{DataNodeId, PartitionId, ReplicaId};
use crate::config::PoolConfig;
use crate::error::Result;
use crate::store::{BlobId, EntryContent};

/// Whether a peer sits in this node's datacenter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    IntraColo,
    InterColo,
}

impl Locality {
    pub fn between(local: &DataNodeId, remote: &DataNodeId) -> Self {
        if local.same_datacenter(remote) {
            Locality::IntraColo
        } else {
            Locality::InterColo
        }
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locality::IntraColo => write!(f, "intra-colo"),
            Locality::InterColo => write!(f, "inter-colo"),
        }
    }
}

/// Policy of one replica thread pool
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Number of replica threads
    pub threads: usize,
    /// Connection timeout for peer calls
    pub connect_timeout: Duration,
    /// Timeout for one metadata exchange or content fetch
    pub request_timeout: Duration,
    /// Caps on one metadata exchange
    pub limits: BatchLimits,
    /// Sleep after a round that made no progress
    pub round_interval: Duration,
    /// Pause between two peers within a round
    pub peer_pacing: Duration,
    /// First retry delay after a failed cycle
    pub backoff_base: Duration,
    /// Ceiling for the retry delay
    pub backoff_max: Duration,
}

impl ReplicationConfig {
    /// Build from configuration, using `auto_threads` when the configured
    /// thread count is 0
    pub fn from_pool(pool: &PoolConfig, auto_threads: usize) -> Self {
        let threads = if pool.threads == 0 { auto_threads } else { pool.threads };
        Self {
            threads: threads.max(1),
            connect_timeout: Duration::from_millis(pool.connect_timeout_ms),
            request_timeout: Duration::from_millis(pool.request_timeout_ms),
            limits: BatchLimits {
                max_entries: pool.max_batch_entries,
                max_bytes: pool.max_batch_bytes,
            },
            round_interval: Duration::from_millis(pool.round_interval_ms),
            peer_pacing: Duration::from_millis(pool.peer_pacing_ms),
            backoff_base: Duration::from_millis(pool.backoff_base_ms),
            backoff_max: Duration::from_millis(pool.backoff_max_ms),
        }
    }

    pub fn new_backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::from_pool(&PoolConfig::intra_colo(), 1)
    }
}

/// Client side of the peer protocol
///
/// Returns [`crate::Error::UnknownPartition`] when the peer does not host
/// the partition.
#[async_trait::async_trait]
pub trait ReplicaClient: Send + Sync {
    /// Ask the peer for entries beyond `token`
    async fn exchange_metadata(
        &self,
        peer: &ReplicaId,
        token: Token,
        limits: BatchLimits,
    ) -> Result<MetadataBatch>;

    /// Fetch the content of blobs missing locally, in one call
    async fn get_missing(
        &self,
        peer: &ReplicaId,
        partition: PartitionId,
        ids: Vec<BlobId>,
    ) -> Result<Vec<EntryContent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locality() {
        let a = DataNodeId::new("a", 1, "dc1");
        let b = DataNodeId::new("b", 1, "dc1");
        let c = DataNodeId::new("c", 1, "dc2");
        assert_eq!(Locality::between(&a, &b), Locality::IntraColo);
        assert_eq!(Locality::between(&a, &c), Locality::InterColo);
    }

    #[test]
    fn test_auto_threads() {
        let mut pool = PoolConfig::intra_colo();
        assert_eq!(ReplicationConfig::from_pool(&pool, 6).threads, 6);
        pool.threads = 2;
        assert_eq!(ReplicationConfig::from_pool(&pool, 6).threads, 2);
        assert_eq!(ReplicationConfig::from_pool(&PoolConfig::intra_colo(), 0).threads, 1);
    }
}
