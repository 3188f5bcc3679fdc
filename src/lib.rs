//! WolfSync - Replication Engine for a Distributed Blob Store
//!
//! Keeps every replica of a partition converging on the same set of blobs
//! by pulling from its peer replicas on other nodes.
//!
//! # Architecture
//!
//! Replication is pull-based. For each local replica, every peer replica
//! of the same partition is tracked with a resumable token. Replica
//! threads cycle through their assigned peers, exchanging metadata,
//! fetching only the blobs missing locally and advancing the token once
//! the batch is applied. Peers in the local datacenter and peers in
//! remote datacenters are served by separate pools with separate policies.
//!
//! # Features
//!
//! - Intra-colo and inter-colo replica thread pools
//! - Per-peer state tracking with exponential retry backoff
//! - Periodic token checkpoints so restarts resume where they left off
//! - Framed TCP peer protocol with checksummed messages
//! - HTTP API for replication status and metrics

pub mod config;
pub mod error;
pub mod cluster;
pub mod store;
pub mod replication;
pub mod network;
pub mod api;
pub mod tuning;

pub use config::WolfSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{ClusterMap, DataNodeId, PartitionId, ReplicaId, StaticClusterMap};
    pub use crate::store::{BlobId, LocalStore, MemoryStore, ReplicaSource};
    pub use crate::replication::{
        RemoteReplicaInfo, ReplicaClient, ReplicaState, ReplicationManager, Token,
    };
}
