//! Test doubles for replication: in-memory peers reachable through a
//! [`ReplicaClient`], and local stores that fail or stall on demand.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{BatchLimits, Locality, MetadataBatch, RemoteReplicaInfo, ReplicaClient, ReplicationConfig, Token};
use crate::cluster::{DataNodeId, PartitionId, ReplicaId};
use crate::error::{Error, Result};
use crate::store::{BlobId, EntryContent, LocalStore, MemoryStore, ReplicaSource};

pub(crate) fn node(host: &str, datacenter: &str) -> DataNodeId {
    DataNodeId::new(host, 7654, datacenter)
}

pub(crate) fn replica(partition: u64, node: &DataNodeId) -> ReplicaId {
    ReplicaId::new(PartitionId(partition), node.clone(), "/mnt0", 1 << 30, false)
}

pub(crate) fn remote_info(partition: u64, local: &DataNodeId, remote: &DataNodeId) -> Arc<RemoteReplicaInfo> {
    Arc::new(RemoteReplicaInfo::new(
        replica(partition, local),
        replica(partition, remote),
        Locality::between(local, remote),
    ))
}

pub(crate) fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        threads: 1,
        connect_timeout: Duration::from_millis(100),
        request_timeout: Duration::from_millis(200),
        limits: BatchLimits {
            max_entries: 100,
            max_bytes: 1 << 20,
        },
        round_interval: Duration::from_millis(10),
        peer_pacing: Duration::ZERO,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(4),
    }
}

/// A peer node serving its journal from a [`MemoryStore`]
#[derive(Default)]
pub(crate) struct InMemoryPeer {
    pub store: Arc<MemoryStore>,
    unreachable: AtomicBool,
    hang: AtomicBool,
    corrupt: Mutex<HashSet<BlobId>>,
    withhold: Mutex<HashSet<BlobId>>,
    pub exchange_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub fetched_ids: AtomicUsize,
}

impl InMemoryPeer {
    pub fn hosting(partitions: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(MemoryStore::with_partitions(
                partitions.iter().map(|p| PartitionId(*p)),
            )),
            ..Default::default()
        })
    }

    pub async fn write(&self, partition: u64, id: &str, data: &[u8]) -> Token {
        self.store
            .write_blob(PartitionId(partition), id, data.to_vec())
            .await
            .unwrap()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Serve a bad checksum for this blob
    pub fn corrupt(&self, id: &str) {
        self.corrupt.lock().insert(id.into());
    }

    /// Leave this blob out of fetch responses
    pub fn withhold(&self, id: &str) {
        self.withhold.lock().insert(id.into());
    }

    async fn gate(&self, peer: &ReplicaId) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::ConnectionTimeout(peer.node().address()));
        }
        Ok(())
    }
}

/// Routes protocol calls to in-memory peers by node
#[derive(Default)]
pub(crate) struct MockCluster {
    peers: HashMap<DataNodeId, Arc<InMemoryPeer>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, node: &DataNodeId, peer: Arc<InMemoryPeer>) -> Self {
        self.peers.insert(node.clone(), peer);
        self
    }

    fn peer(&self, replica: &ReplicaId) -> Result<&Arc<InMemoryPeer>> {
        self.peers
            .get(replica.node())
            .ok_or_else(|| Error::ConnectionFailed {
                address: replica.node().address(),
                reason: "connection refused".into(),
            })
    }
}

#[async_trait::async_trait]
impl ReplicaClient for MockCluster {
    async fn exchange_metadata(
        &self,
        peer: &ReplicaId,
        token: Token,
        limits: BatchLimits,
    ) -> Result<MetadataBatch> {
        let node = self.peer(peer)?;
        node.exchange_calls.fetch_add(1, Ordering::SeqCst);
        node.gate(peer).await?;
        node.store.entries_since(peer.partition(), token, limits).await
    }

    async fn get_missing(
        &self,
        peer: &ReplicaId,
        partition: PartitionId,
        ids: Vec<BlobId>,
    ) -> Result<Vec<EntryContent>> {
        let node = self.peer(peer)?;
        node.fetch_calls.fetch_add(1, Ordering::SeqCst);
        node.fetched_ids.fetch_add(ids.len(), Ordering::SeqCst);
        node.gate(peer).await?;

        let corrupt = node.corrupt.lock().clone();
        let withhold = node.withhold.lock().clone();
        let mut entries = node.store.fetch(partition, &ids).await?;
        entries.retain(|e| !withhold.contains(&e.id));
        for entry in entries.iter_mut() {
            if corrupt.contains(&entry.id) {
                entry.crc32 ^= 0xdead_beef;
            }
        }
        Ok(entries)
    }
}

/// Local store that fails or stalls puts for selected blobs
pub(crate) struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    fail_puts: Mutex<HashSet<BlobId>>,
    put_delay: Mutex<Option<Duration>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_puts: Mutex::new(HashSet::new()),
            put_delay: Mutex::new(None),
        })
    }

    pub fn fail_put(&self, id: &str) {
        self.fail_puts.lock().insert(id.into());
    }

    pub fn heal(&self) {
        self.fail_puts.lock().clear();
    }

    pub fn delay_puts(&self, delay: Duration) {
        *self.put_delay.lock() = Some(delay);
    }
}

#[async_trait::async_trait]
impl LocalStore for FaultyStore {
    fn instance_id(&self) -> &str {
        self.inner.instance_id()
    }

    async fn exists(&self, partition: PartitionId, id: &BlobId) -> Result<bool> {
        self.inner.exists(partition, id).await
    }

    async fn put(&self, entry: &EntryContent) -> Result<()> {
        let delay = *self.put_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_puts.lock().contains(&entry.id) {
            return Err(Error::Store(format!("disk error writing {}", entry.id)));
        }
        self.inner.put(entry).await
    }

    async fn delete(&self, partition: PartitionId, id: &BlobId) -> Result<()> {
        self.inner.delete(partition, id).await
    }
}
