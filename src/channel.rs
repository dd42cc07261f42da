//! Framed message channel.
//!
//! Every message is sent as a frame made of a 4 bytes big-endian length
//! field followed by the `bincode` encoding of the message:
//!
//! ```text
//! 0        4                                   4 + length
//! +--------+-----------------------------------+
//! | length | payload                           |
//! +--------+-----------------------------------+
//! ```
//!
//! Payloads are read in chunks of at most [`CHUNK_SIZE`] bytes until the
//! announced length is reached, so that arbitrarily large model states can
//! be exchanged.

use std::io;

use bytes::BytesMut;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The size of the length field.
pub const LENGTH_FIELD: usize = 4;

/// The maximum number of bytes read from the connection at once.
pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
/// Errors that can occur when sending or receiving a message.
pub enum ChannelError {
    #[error("connection failed: {0}")]
    Connection(#[from] io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
    #[error("message of {0} bytes exceeds the maximum frame length")]
    TooLarge(usize),
}

impl ChannelError {
    /// Whether the peer closed the connection before the whole frame was
    /// received.
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, Self::Connection(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Encode the given message into a frame, length field included.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, ChannelError> {
    let payload = bincode::serialize(message).map_err(ChannelError::Encode)?;
    let length = u32::try_from(payload.len()).map_err(|_| ChannelError::TooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_FIELD + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a complete frame, length field included.
///
/// # Errors
/// Fails with [`ChannelError::Connection`] if the frame is shorter than
/// announced by its length field, and with [`ChannelError::Decode`] if the
/// payload is not a valid encoding of `T`.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ChannelError> {
    let mut reader = frame;
    let mut prefix = [0_u8; LENGTH_FIELD];
    io::Read::read_exact(&mut reader, &mut prefix)?;
    let length = u32::from_be_bytes(prefix) as usize;
    if reader.len() < length {
        return Err(truncated(reader.len(), length));
    }
    bincode::deserialize(&reader[..length]).map_err(ChannelError::Decode)
}

/// Send a message over the given connection.
///
/// The whole frame is written before this returns, otherwise an error is
/// returned.
pub async fn send<W, T>(writer: &mut W, message: &T) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    trace!("sending frame of {} bytes", frame.len());
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a message from the given connection.
pub async fn receive<R, T>(reader: &mut R) -> Result<T, ChannelError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0_u8; LENGTH_FIELD];
    reader.read_exact(&mut prefix).await?;
    let length = u32::from_be_bytes(prefix) as usize;
    trace!("receiving frame with a payload of {} bytes", length);

    // The length comes from the peer: grow the buffer as data actually
    // arrives instead of trusting it for the allocation.
    let mut payload = BytesMut::with_capacity(length.min(CHUNK_SIZE));
    let mut chunk = [0_u8; CHUNK_SIZE];
    while payload.len() < length {
        let wanted = (length - payload.len()).min(CHUNK_SIZE);
        let read = reader.read(&mut chunk[..wanted]).await?;
        if read == 0 {
            return Err(truncated(payload.len(), length));
        }
        payload.extend_from_slice(&chunk[..read]);
    }

    bincode::deserialize(&payload).map_err(ChannelError::Decode)
}

fn truncated(received: usize, expected: usize) -> ChannelError {
    ChannelError::Connection(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "connection closed after {} of {} payload bytes",
            received, expected
        ),
    ))
}
