//! Replication Protocol
//!
//! Defines the wire protocol between a replicating node and the peer it
//! pulls from.

use serde::{Deserialize, Serialize};

use super::Token;
use crate::cluster::PartitionId;
use crate::store::{BlobId, EntryContent, EntryDescriptor};

/// Caps on one metadata exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum descriptors returned
    pub max_entries: usize,
    /// Maximum blob bytes described (the first entry is always returned)
    pub max_bytes: u64,
}

/// Result of a metadata exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataBatch {
    /// Partition the entries belong to
    pub partition: PartitionId,
    /// Entries beyond the requested token, oldest first
    pub entries: Vec<EntryDescriptor>,
    /// Token at the end of `entries`
    pub new_token: Token,
    /// Journal end on the peer, for lag estimation
    pub log_end: u64,
}

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Metadata Exchange ==========
    /// Ask a peer for entries beyond a token
    ExchangeMetadata {
        requester: String,
        partition: PartitionId,
        token: Token,
        limits: BatchLimits,
    },

    /// Descriptors known to the peer beyond the token
    ExchangeMetadataResponse { batch: MetadataBatch },

    // ========== Content Fetch ==========
    /// Ask a peer for the content of missing blobs
    GetMissing {
        requester: String,
        partition: PartitionId,
        ids: Vec<BlobId>,
    },

    /// Content of the requested blobs
    GetMissingResponse {
        partition: PartitionId,
        entries: Vec<EntryContent>,
    },

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The partition is not hosted on the responding node
    UnknownPartition,
    /// The request could not be served as sent
    InvalidRequest,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ExchangeMetadata { .. } => "ExchangeMetadata",
            Message::ExchangeMetadataResponse { .. } => "ExchangeMetadataResponse",
            Message::GetMissing { .. } => "GetMissing",
            Message::GetMissingResponse { .. } => "GetMissingResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from the wire
    pub const MAX_BODY: u32 = 256 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
