//! In-Memory Store
//!
//! Reference implementation of [`LocalStore`] and [`ReplicaSource`]. Each
//! partition keeps its blobs plus an append-only journal; every put or
//! delete that changes local state appends a record, so a node can serve
//! what it has replicated to further peers.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use super::{BlobId, EntryContent, EntryDescriptor, LocalStore, ReplicaSource};
use crate::cluster::PartitionId;
use crate::error::{Error, Result};
use crate::replication::protocol::{BatchLimits, MetadataBatch};
use crate::replication::Token;

/// Fixed per-record journal footprint on top of the blob bytes
pub const RECORD_OVERHEAD: u64 = 32;

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct JournalRecord {
    start: u64,
    id: BlobId,
    size: u64,
    deleted: bool,
}

impl JournalRecord {
    fn end(&self) -> u64 {
        self.start + RECORD_OVERHEAD + self.size
    }
}

#[derive(Debug, Default)]
struct PartitionLog {
    blobs: HashMap<BlobId, StoredBlob>,
    journal: Vec<JournalRecord>,
    end_offset: u64,
}

impl PartitionLog {
    fn append(&mut self, id: BlobId, size: u64, deleted: bool) {
        let record = JournalRecord {
            start: self.end_offset,
            id,
            size,
            deleted,
        };
        self.end_offset = record.end();
        self.journal.push(record);
    }

    /// Returns false when the blob was already present
    fn apply_put(&mut self, id: &BlobId, data: &[u8], deleted: bool) -> bool {
        if self.blobs.contains_key(id) {
            return false;
        }
        self.blobs.insert(
            id.clone(),
            StoredBlob {
                data: data.to_vec(),
                deleted,
            },
        );
        self.append(id.clone(), data.len() as u64, deleted);
        true
    }

    /// Returns false when the blob was already deleted
    fn apply_delete(&mut self, id: &BlobId) -> bool {
        match self.blobs.get_mut(id) {
            Some(blob) if blob.deleted => return false,
            Some(blob) => blob.deleted = true,
            None => {
                // Tombstone for a blob we never saw, so a late put cannot
                // resurrect it
                self.blobs.insert(
                    id.clone(),
                    StoredBlob {
                        data: Vec::new(),
                        deleted: true,
                    },
                );
            }
        }
        self.append(id.clone(), 0, true);
        true
    }
}

/// In-memory blob store with per-partition journals
///
/// Contents do not survive the process, so every instance gets a fresh
/// random identity.
#[derive(Debug)]
pub struct MemoryStore {
    instance_id: String,
    partitions: RwLock<HashMap<PartitionId, PartitionLog>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_partitions(Vec::new())
    }
}

impl MemoryStore {
    /// Create an empty store hosting no partitions
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store hosting the given partitions
    pub fn with_partitions(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        let logs = partitions
            .into_iter()
            .map(|p| (p, PartitionLog::default()))
            .collect();
        Self {
            instance_id: format!("memory-{:016x}", rand::random::<u64>()),
            partitions: RwLock::new(logs),
        }
    }

    /// Start hosting a partition (no-op if already hosted)
    pub async fn add_partition(&self, partition: PartitionId) {
        self.partitions.write().await.entry(partition).or_default();
    }

    /// Client write: store a blob and return the journal end
    pub async fn write_blob(
        &self,
        partition: PartitionId,
        id: impl Into<BlobId>,
        data: Vec<u8>,
    ) -> Result<Token> {
        let mut partitions = self.partitions.write().await;
        let log = partitions
            .get_mut(&partition)
            .ok_or(Error::UnknownPartition(partition.0))?;
        log.apply_put(&id.into(), &data, false);
        Ok(Token::new(log.end_offset))
    }

    /// Client delete: tombstone a blob and return the journal end
    pub async fn delete_blob(&self, partition: PartitionId, id: impl Into<BlobId>) -> Result<Token> {
        let mut partitions = self.partitions.write().await;
        let log = partitions
            .get_mut(&partition)
            .ok_or(Error::UnknownPartition(partition.0))?;
        log.apply_delete(&id.into());
        Ok(Token::new(log.end_offset))
    }

    /// Read a blob and its deleted flag
    pub async fn get(&self, partition: PartitionId, id: &BlobId) -> Option<(Vec<u8>, bool)> {
        let partitions = self.partitions.read().await;
        partitions
            .get(&partition)?
            .blobs
            .get(id)
            .map(|b| (b.data.clone(), b.deleted))
    }

    /// Journal end offset of a partition
    pub async fn log_end(&self, partition: PartitionId) -> Result<u64> {
        let partitions = self.partitions.read().await;
        partitions
            .get(&partition)
            .map(|log| log.end_offset)
            .ok_or(Error::UnknownPartition(partition.0))
    }

    /// Every blob of a partition with its deleted flag, ordered by id
    pub async fn contents(&self, partition: PartitionId) -> BTreeMap<BlobId, (Vec<u8>, bool)> {
        let partitions = self.partitions.read().await;
        partitions
            .get(&partition)
            .map(|log| {
                log.blobs
                    .iter()
                    .map(|(id, b)| (id.clone(), (b.data.clone(), b.deleted)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of journal records in a partition
    pub async fn journal_len(&self, partition: PartitionId) -> usize {
        let partitions = self.partitions.read().await;
        partitions.get(&partition).map_or(0, |log| log.journal.len())
    }
}

#[async_trait::async_trait]
impl LocalStore for MemoryStore {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn exists(&self, partition: PartitionId, id: &BlobId) -> Result<bool> {
        let partitions = self.partitions.read().await;
        let log = partitions
            .get(&partition)
            .ok_or(Error::UnknownPartition(partition.0))?;
        Ok(log.blobs.contains_key(id))
    }

    async fn put(&self, entry: &EntryContent) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        let log = partitions
            .get_mut(&entry.partition)
            .ok_or(Error::UnknownPartition(entry.partition.0))?;
        if !log.apply_put(&entry.id, &entry.data, entry.deleted) {
            tracing::trace!("Blob {} already present in partition {}", entry.id, entry.partition);
        }
        Ok(())
    }

    async fn delete(&self, partition: PartitionId, id: &BlobId) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        let log = partitions
            .get_mut(&partition)
            .ok_or(Error::UnknownPartition(partition.0))?;
        log.apply_delete(id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplicaSource for MemoryStore {
    async fn hosts(&self, partition: PartitionId) -> bool {
        self.partitions.read().await.contains_key(&partition)
    }

    async fn entries_since(
        &self,
        partition: PartitionId,
        token: Token,
        limits: BatchLimits,
    ) -> Result<MetadataBatch> {
        let partitions = self.partitions.read().await;
        let log = partitions
            .get(&partition)
            .ok_or(Error::UnknownPartition(partition.0))?;

        let first = log.journal.partition_point(|r| r.start < token.offset());
        let mut entries = Vec::new();
        let mut bytes = 0u64;
        let mut new_token = token;

        for record in &log.journal[first..] {
            if entries.len() >= limits.max_entries {
                break;
            }
            // An oversized first entry still goes out alone
            if !entries.is_empty() && bytes + record.size > limits.max_bytes {
                break;
            }
            bytes += record.size;
            new_token = Token::new(record.end());
            entries.push(EntryDescriptor {
                id: record.id.clone(),
                size: record.size,
                deleted: record.deleted,
            });
        }

        Ok(MetadataBatch {
            partition,
            entries,
            new_token,
            log_end: log.end_offset,
        })
    }

    async fn fetch(&self, partition: PartitionId, ids: &[BlobId]) -> Result<Vec<EntryContent>> {
        let partitions = self.partitions.read().await;
        let log = partitions
            .get(&partition)
            .ok_or(Error::UnknownPartition(partition.0))?;

        Ok(ids
            .iter()
            .filter_map(|id| {
                log.blobs
                    .get(id)
                    .map(|b| EntryContent::new(partition, id.clone(), b.data.clone(), b.deleted))
            })
            .collect())
    }
}
