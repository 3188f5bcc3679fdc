//! Cluster Map Module
//!
//! Partition and replica identities, and the narrow view of cluster
//! membership the replication engine consumes.

mod map;

pub use map::{ClusterMap, DataNodeId, PartitionId, ReplicaId, StaticClusterMap};
