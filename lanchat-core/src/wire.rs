//! Control-frame codec: a little-endian `u32` length, then the bincode body.
//!
//! Only the handshake and discovery speak frames. After the handshake a
//! stream switches to newline-delimited chat lines.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// Control frames are small; anything larger is a confused or hostile peer.
const MAX_FRAME_LEN: u32 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("truncated frame")]
    Truncated,
    #[error("bincode: {0}")]
    Codec(#[from] bincode::Error),
}

fn checked_len(len: usize) -> Result<u32, FrameError> {
    match u32::try_from(len) {
        Ok(n) if n <= MAX_FRAME_LEN => Ok(n),
        _ => Err(FrameError::TooLarge(u32::try_from(len).unwrap_or(u32::MAX))),
    }
}

/// One message as a complete frame, ready for a datagram or a stream.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(msg)?;
    let len = checked_len(body.len())?;
    let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend(body);
    Ok(frame)
}

/// Decode the frame at the front of `bytes`, returning the message and the
/// bytes it took. A datagram shorter than its header claims is `Truncated`.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameError> {
    let (header, rest) = bytes
        .split_first_chunk::<LEN_SIZE>()
        .ok_or(FrameError::Truncated)?;
    let len = u32::from_le_bytes(*header);
    checked_len(len as usize)?;
    let body = rest.get(..len as usize).ok_or(FrameError::Truncated)?;
    Ok((bincode::deserialize(body)?, LEN_SIZE + body.len()))
}

/// Read exactly one frame from a stream.
///
/// Reads only the bytes of that frame, so whatever follows on the stream is
/// left for the next reader (the line codec, after a handshake).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
    let len = reader.read_u32_le().await?;
    checked_len(len as usize)?;
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), FrameError> {
    writer.write_all(&encode_frame(msg)?).await?;
    writer.flush().await?;
    Ok(())
}
