//! Frame codecs.
//!
//! Two layers:
//!
//! - **Outer**: on byte streams every frame is `u32` big-endian length ∥ body.
//!   Relay tunnels carry bodies as discrete messages and need no prefix.
//! - **Inner**: the plaintext of an encrypted body is
//!   `type (u8) ∥ stream ID (u32 BE) ∥ payload`.
//!
//! An encrypted body is `sequence (u64 BE) ∥ ciphertext`.

use crate::error::{TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the outer length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the clear sequence number heading every encrypted body
pub const SEQUENCE_SIZE: usize = 8;

/// Size of the inner plaintext header (type + stream ID)
pub const INNER_HEADER_SIZE: usize = 5;

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Returns `TransportError::FrameTooLarge` if `body` exceeds `max_frame`, or
/// an I/O error from the writer.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_frame: usize) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > max_frame {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: max_frame,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
        size: body.len(),
        max: max_frame,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Returns `TransportError::FrameTooLarge` if the announced length exceeds
/// `max_frame`, or an I/O error (including EOF inside a frame).
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> TransportResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    if reader.read(&mut prefix[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[1..]).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: max_frame,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Kind of an inner (decrypted) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Application data for a stream
    Data = 0x01,
    /// Orderly channel shutdown
    Close = 0x02,
    /// Liveness only; carries no payload
    Keepalive = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Close),
            0x03 => Ok(FrameType::Keepalive),
            other => Err(other),
        }
    }
}

/// Decrypted frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerFrame {
    /// Frame kind
    pub kind: FrameType,
    /// Stream the frame belongs to (0 for control frames)
    pub stream_id: u32,
    /// Application payload
    pub payload: Vec<u8>,
}

impl InnerFrame {
    /// A data frame.
    #[must_use]
    pub fn data(stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// A payload-less control frame.
    #[must_use]
    pub fn control(kind: FrameType) -> Self {
        Self {
            kind,
            stream_id: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to plaintext bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INNER_HEADER_SIZE + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse plaintext bytes. `None` means the plaintext is malformed.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < INNER_HEADER_SIZE {
            return None;
        }
        let kind = FrameType::try_from(bytes[0]).ok()?;
        let stream_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(Self {
            kind,
            stream_id,
            payload: bytes[INNER_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Build an encrypted body from a sequence number and ciphertext.
#[must_use]
pub fn encode_sealed(sequence: u64, ciphertext: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(SEQUENCE_SIZE + ciphertext.len());
    body.extend_from_slice(&sequence.to_be_bytes());
    body.extend_from_slice(ciphertext);
    body
}

/// Split an encrypted body into sequence number and ciphertext.
#[must_use]
pub fn decode_sealed(body: &[u8]) -> Option<(u64, &[u8])> {
    if body.len() < SEQUENCE_SIZE + veil_crypto::aead::TAG_SIZE {
        return None;
    }
    let mut seq = [0u8; SEQUENCE_SIZE];
    seq.copy_from_slice(&body[..SEQUENCE_SIZE]);
    Some((u64::from_be_bytes(seq), &body[SEQUENCE_SIZE..]))
}
