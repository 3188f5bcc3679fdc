//! Network Client
//!
//! TCP client for pulling from peer nodes. Keeps one idle connection per
//! peer address; concurrent requests to the same peer open extra
//! short-lived connections rather than queueing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::cluster::{PartitionId, ReplicaId};
use crate::error::{Error, Result};
use crate::replication::{
    BatchLimits, ErrorCode, Message, MetadataBatch, ReplicaClient, Token,
};
use crate::store::{BlobId, EntryContent};

/// Connection pool entry
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
    /// False while a request is in flight; a request abandoned midway
    /// leaves it false and the connection is discarded
    clean: bool,
}

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(
            self.request_timeout,
            self.send_inner(address, &message),
        ).await;

        match result {
            Ok(inner_result) => inner_result,
            Err(_) => {
                self.remove_connection(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: &Message) -> Result<Message> {
        // Reuse the pooled connection if nobody else is using it
        if let Some(pooled) = self.get_connection(address).await {
            if let Ok(mut entry) = pooled.try_lock() {
                if entry.clean {
                    entry.clean = false;
                    match request(&mut entry.stream, message).await {
                        Ok(response) => {
                            entry.clean = true;
                            entry.last_used = Instant::now();
                            return Ok(response);
                        }
                        Err(e) => {
                            tracing::debug!("Pooled connection to {} failed, reconnecting: {}", address, e);
                        }
                    }
                }
                drop(entry);
                self.remove_connection(address).await;
            }
        }

        let mut stream = self.connect(address).await?;
        let response = request(&mut stream, message).await?;
        self.store_connection(address, stream).await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(
            self.connect_timeout,
            TcpStream::connect(address),
        ).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Keep a connection for reuse unless one is already pooled
    async fn store_connection(&self, address: &str, stream: TcpStream) {
        let mut pool = self.pool.write().await;
        pool.entry(address.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(PoolEntry {
                stream,
                last_used: Instant::now(),
                clean: true,
            }))
        });
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Clean up stale connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.write().await;
        let now = Instant::now();

        pool.retain(|addr, entry| {
            if let Ok(e) = entry.try_lock() {
                if now.duration_since(e.last_used) > max_idle {
                    tracing::debug!("Removing stale connection to {}", addr);
                    return false;
                }
            }
            true
        });
    }

    /// Close all connections
    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        pool.clear();
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

async fn request(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}

/// [`ReplicaClient`] speaking the peer protocol over TCP
pub struct TcpReplicaClient {
    network: NetworkClient,
    /// Identity sent with every request, for the peer's logs
    requester: String,
}

impl TcpReplicaClient {
    pub fn new(requester: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            network: NetworkClient::new(connect_timeout, request_timeout),
            requester: requester.into(),
        }
    }

    pub fn network(&self) -> &NetworkClient {
        &self.network
    }
}

fn remote_error(address: &str, partition: PartitionId, code: ErrorCode, message: String) -> Error {
    match code {
        ErrorCode::UnknownPartition => Error::UnknownPartition(partition.0),
        ErrorCode::InvalidRequest => {
            Error::Protocol(format!("{} rejected request: {}", address, message))
        }
        ErrorCode::Internal => Error::Replication(format!("{} failed: {}", address, message)),
    }
}

fn unexpected(address: &str, response: &Message) -> Error {
    Error::Protocol(format!("unexpected {} from {}", response.type_name(), address))
}

#[async_trait::async_trait]
impl ReplicaClient for TcpReplicaClient {
    async fn exchange_metadata(
        &self,
        peer: &ReplicaId,
        token: Token,
        limits: BatchLimits,
    ) -> Result<MetadataBatch> {
        let address = peer.node().address();
        let request = Message::ExchangeMetadata {
            requester: self.requester.clone(),
            partition: peer.partition(),
            token,
            limits,
        };

        match self.network.send(&address, request).await? {
            Message::ExchangeMetadataResponse { batch } => Ok(batch),
            Message::Error { code, message } => {
                Err(remote_error(&address, peer.partition(), code, message))
            }
            other => Err(unexpected(&address, &other)),
        }
    }

    async fn get_missing(
        &self,
        peer: &ReplicaId,
        partition: PartitionId,
        ids: Vec<BlobId>,
    ) -> Result<Vec<EntryContent>> {
        let address = peer.node().address();
        let request = Message::GetMissing {
            requester: self.requester.clone(),
            partition,
            ids,
        };

        match self.network.send(&address, request).await? {
            Message::GetMissingResponse {
                partition: answered,
                entries,
            } if answered == partition => Ok(entries),
            Message::Error { code, message } => {
                Err(remote_error(&address, partition, code, message))
            }
            other => Err(unexpected(&address, &other)),
        }
    }
}
