//! Local Store Module
//!
//! The narrow contract the replication engine has with the local
//! persistent store: existence checks, blob writes and deletes for
//! applying replicated entries, and the journal view served to peers.

mod memory;

pub use memory::{MemoryStore, RECORD_OVERHEAD};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::PartitionId;
use crate::error::{Error, Result};
use crate::replication::protocol::{BatchLimits, MetadataBatch};
use crate::replication::Token;

/// Opaque identifier of a blob within a partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub String);

impl BlobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        BlobId(s.to_string())
    }
}

impl From<String> for BlobId {
    fn from(s: String) -> Self {
        BlobId(s)
    }
}

/// One entry of a peer's history, as returned by a metadata exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub id: BlobId,
    /// Blob size in bytes (0 for delete markers)
    pub size: u64,
    /// Delete marker rather than a blob write
    pub deleted: bool,
}

impl EntryDescriptor {
    pub fn put(id: impl Into<BlobId>, size: u64) -> Self {
        Self {
            id: id.into(),
            size,
            deleted: false,
        }
    }

    pub fn delete(id: impl Into<BlobId>) -> Self {
        Self {
            id: id.into(),
            size: 0,
            deleted: true,
        }
    }
}

/// Blob content fetched from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryContent {
    pub partition: PartitionId,
    pub id: BlobId,
    pub data: Vec<u8>,
    /// The blob was deleted on the peer after it was written
    pub deleted: bool,
    /// CRC32 of `data`, computed by the sender
    pub crc32: u32,
}

impl EntryContent {
    pub fn new(partition: PartitionId, id: BlobId, data: Vec<u8>, deleted: bool) -> Self {
        let crc32 = crc32fast::hash(&data);
        Self {
            partition,
            id,
            data,
            deleted,
            crc32,
        }
    }

    /// Verify the payload against the sender's checksum
    pub fn verify(&self) -> Result<()> {
        let actual = crc32fast::hash(&self.data);
        if actual != self.crc32 {
            return Err(Error::ChecksumMismatch {
                blob_id: self.id.to_string(),
                expected: self.crc32,
                actual,
            });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Gateway into the local persistent store
///
/// Implementations must be safe to call concurrently from every replica
/// thread, idempotent per entry, and read-your-writes: a successful `put`
/// or `delete` is visible to the next `exists`.
#[async_trait::async_trait]
pub trait LocalStore: Send + Sync {
    /// Identity of the data this store holds. A store that loses its
    /// contents (a restarted in-memory store, a wiped disk) must report a
    /// new identity, since tokens checkpointed under the old one point past
    /// data that is no longer here.
    fn instance_id(&self) -> &str;

    /// Check whether the blob has any record (live or deleted) locally
    async fn exists(&self, partition: PartitionId, id: &BlobId) -> Result<bool>;

    /// Write a replicated blob; writing an already-present blob succeeds
    /// without changing it
    async fn put(&self, entry: &EntryContent) -> Result<()>;

    /// Delete or tombstone a blob; deleting an absent or already-deleted
    /// blob succeeds
    async fn delete(&self, partition: PartitionId, id: &BlobId) -> Result<()>;
}

/// Serving side of the peer protocol over the local journal
#[async_trait::async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Check whether a replica of `partition` lives here
    async fn hosts(&self, partition: PartitionId) -> bool;

    /// Describe journal entries at or beyond `token`, bounded by `limits`
    async fn entries_since(
        &self,
        partition: PartitionId,
        token: Token,
        limits: BatchLimits,
    ) -> Result<MetadataBatch>;

    /// Return content for the requested blobs; unknown ids are omitted
    async fn fetch(&self, partition: PartitionId, ids: &[BlobId]) -> Result<Vec<EntryContent>>;
}
