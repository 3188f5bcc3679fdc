//! Replication Groups
//!
//! Splits the peers of one locality across a fixed number of replica
//! threads. Every peer lands in exactly one bucket and bucket sizes differ
//! by at most one.

use std::sync::Arc;

use super::remote_replica::RemoteReplicaInfo;
use super::Locality;

/// Assignment of the peers of one locality to replica threads
#[derive(Debug, Clone)]
pub struct ReplicationGroup {
    locality: Locality,
    buckets: Vec<Vec<Arc<RemoteReplicaInfo>>>,
}

impl ReplicationGroup {
    /// Deal the matching, non-disabled peers round-robin in key order over
    /// at most `threads` buckets. No bucket is left empty.
    pub fn assign(locality: Locality, threads: usize, peers: &[Arc<RemoteReplicaInfo>]) -> Self {
        let mut eligible: Vec<_> = peers
            .iter()
            .filter(|p| p.locality() == locality && !p.is_disabled())
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.key().cmp(b.key()));

        let count = threads.max(1).min(eligible.len());
        let mut buckets = vec![Vec::new(); count];
        for (i, peer) in eligible.into_iter().enumerate() {
            buckets[i % count].push(peer);
        }

        Self { locality, buckets }
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    pub fn buckets(&self) -> &[Vec<Arc<RemoteReplicaInfo>>] {
        &self.buckets
    }

    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
