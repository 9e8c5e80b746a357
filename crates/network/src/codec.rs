//! Length-prefixed frame codec.
//!
//! One frame is `[u32 big-endian length][UTF-8 JSON payload]`. The length
//! prefix must equal the exact payload byte count; a mismatch at any point is
//! a protocol error for that connection, not a recoverable short read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::wire::Envelope;

/// Hard cap on a declared payload length, so a corrupt or hostile prefix
/// cannot drive an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

/// Serialize an envelope into one complete frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(envelope)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one complete frame.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame, blocking until it is fully on hand.
///
/// A clean close on the frame boundary is `FrameError::Closed` so the read
/// loop can distinguish an orderly disconnect from a torn frame. A single
/// underlying read is never assumed to return the full prefix or payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    // Length prefix, looping on partial reads so a zero-byte read at the
    // boundary can be told apart from one mid-prefix.
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Closed
            } else {
                FrameError::Truncated
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(serde_json::from_slice(&payload)?)
}
