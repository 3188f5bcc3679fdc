//! Network Server
//!
//! TCP server answering the peer protocol from the local journal.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message};
use crate::cluster::PartitionId;
use crate::error::{Error, Result};
use crate::replication::{ErrorCode, Message, ReplicationMetrics};
use crate::store::ReplicaSource;

/// Serves metadata exchanges and content fetches to peers
pub struct ReplicaServer {
    /// Bind address
    bind_address: String,
    /// Journal being served
    source: Arc<dyn ReplicaSource>,
    metrics: Arc<ReplicationMetrics>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl ReplicaServer {
    /// Create a new replica server
    pub fn new(
        bind_address: impl Into<String>,
        source: Arc<dyn ReplicaSource>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address: bind_address.into(),
            source,
            metrics,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listener without serving yet
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Replica server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let source = Arc::clone(&self.source);
                            let metrics = Arc::clone(&self.metrics);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, source, metrics).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Replica server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    source: Arc<dyn ReplicaSource>,
    metrics: Arc<ReplicationMetrics>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handle_request(source.as_ref(), &metrics, message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

fn error_response(code: ErrorCode, message: impl Into<String>) -> Message {
    Message::Error {
        code,
        message: message.into(),
    }
}

fn unknown_partition(metrics: &ReplicationMetrics, requester: &str, partition: PartitionId) -> Message {
    metrics.record_unknown_remote_replica();
    tracing::debug!("{} asked for partition {} which is not hosted here", requester, partition);
    error_response(
        ErrorCode::UnknownPartition,
        format!("partition {} is not hosted here", partition),
    )
}

/// Answer one protocol request
pub async fn handle_request(
    source: &dyn ReplicaSource,
    metrics: &ReplicationMetrics,
    message: Message,
) -> Message {
    match message {
        Message::ExchangeMetadata {
            requester,
            partition,
            token,
            limits,
        } => {
            if !source.hosts(partition).await {
                return unknown_partition(metrics, &requester, partition);
            }
            if limits.max_entries == 0 || limits.max_bytes == 0 {
                return error_response(ErrorCode::InvalidRequest, "batch limits must be non-zero");
            }
            match source.entries_since(partition, token, limits).await {
                Ok(batch) => Message::ExchangeMetadataResponse { batch },
                Err(Error::UnknownPartition(_)) => unknown_partition(metrics, &requester, partition),
                Err(e) => {
                    tracing::error!("Metadata exchange for {} failed: {}", requester, e);
                    error_response(ErrorCode::Internal, e.to_string())
                }
            }
        }

        Message::GetMissing {
            requester,
            partition,
            ids,
        } => {
            if !source.hosts(partition).await {
                return unknown_partition(metrics, &requester, partition);
            }
            match source.fetch(partition, &ids).await {
                Ok(entries) => Message::GetMissingResponse { partition, entries },
                Err(Error::UnknownPartition(_)) => unknown_partition(metrics, &requester, partition),
                Err(e) => {
                    tracing::error!("Fetch for {} failed: {}", requester, e);
                    error_response(ErrorCode::Internal, e.to_string())
                }
            }
        }

        other => error_response(
            ErrorCode::InvalidRequest,
            format!("{} is not a request", other.type_name()),
        ),
    }
}
