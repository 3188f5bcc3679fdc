//! Network Module
//!
//! TCP transport for the peer protocol: framed messages, a pooled client
//! implementing [`crate::replication::ReplicaClient`], and the server that
//! answers peers from the local journal.

mod server;
mod client;

pub use server::{handle_request, ReplicaServer};
pub use client::{NetworkClient, TcpReplicaClient};

use crate::replication::{Message, FrameHeader};
use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_BODY {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            header.length,
            FrameHeader::MAX_BODY
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    if body.len() > FrameHeader::MAX_BODY as usize {
        return Err(Error::Protocol(format!(
            "{} of {} bytes exceeds the frame limit",
            message.type_name(),
            body.len()
        )));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
