//! WolfSync Error Types

use thiserror::Error;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Checksum mismatch for blob {blob_id}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        blob_id: String,
        expected: u32,
        actual: u32,
    },

    // Replication errors
    #[error("Partition {0} is not hosted on this node")]
    UnknownPartition(u64),

    #[error("Token regression for {replica}: current offset {current}, proposed {proposed}")]
    TokenRegression {
        replica: String,
        current: u64,
        proposed: u64,
    },

    #[error("Replication error: {0}")]
    Replication(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Local store errors
    #[error("Store error: {0}")]
    Store(String),

    // Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Failed to restore replica tokens: {0}")]
    CheckpointRestore(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("{remaining} replica thread(s) did not stop within the grace period and were aborted")]
    ShutdownTimeout { remaining: usize },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is a transient peer/network failure that a
    /// retry after backoff may clear
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Io(_)
        )
    }

    /// Check if this error points at bad data from a peer rather than
    /// at the transport
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::ChecksumMismatch { .. }
                | Error::TokenRegression { .. }
                | Error::Serialization(_)
        )
    }
}
