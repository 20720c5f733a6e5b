//! Frame codec for the IPC wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ type(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(type byte) + sizeof(payload), NOT including the 4-byte prefix.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Message type: request from client.
pub const MSG_REQUEST: u8 = 0x01;
/// Message type: response to client.
pub const MSG_RESPONSE: u8 = 0x02;
/// Message type: streaming response chunk.
pub const MSG_STREAM_CHUNK: u8 = 0x03;
/// Message type: end of streaming response.
pub const MSG_STREAM_END: u8 = 0x04;
/// Message type: error response to client.
pub const MSG_ERROR: u8 = 0xFF;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode `value` as named msgpack into a frame of `msg_type`.
    pub fn encode<T: Serialize>(msg_type: u8, value: &T) -> io::Result<Self> {
        let payload = rmp_serde::to_vec_named(value).map_err(|e| {
            tracing::error!("msgpack_encode_failed: {}", e);
            io::Error::new(io::ErrorKind::InvalidData, e.to_string())
        })?;
        Ok(Self { msg_type, payload })
    }

    /// Decode the payload as msgpack.
    pub fn decode<T: DeserializeOwned>(&self) -> io::Result<T> {
        rmp_serde::from_slice(&self.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid msgpack: {}", e)))
    }
}

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF before a length prefix. `max_frame_bytes`
/// caps the accepted frame length.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame too short: missing type byte",
        ));
    }

    let mut msg_type = [0u8; 1];
    reader.read_exact(&mut msg_type).await?;
    let mut payload = vec![0u8; frame_len as usize - 1];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        msg_type: msg_type[0],
        payload,
    }))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let frame_len = u32::try_from(frame.payload.len() + 1).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes does not fit a frame", frame.payload.len()),
        )
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[frame.msg_type]).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}
