//! Frame codec for node-to-node traffic.
//!
//! Two layers:
//! - **Framing**: `LengthDelimitedCodec` with a 4-byte length prefix gives each
//!   frame an atomic boundary on the byte stream.
//! - **Body**: `zstd(request_id ++ payload)`, where the id is the fixed 36-byte
//!   ASCII form and the payload is opaque.

use std::io::Read;

use bytes::Bytes;
use tokio_util::codec::LengthDelimitedCodec;

use super::protocol::{REQUEST_ID_LEN, RequestId};

/// Default zstd level for outbound frames.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default ceiling on a single frame, compressed.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// A decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: RequestId,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to compress frame: {0}")]
    Compress(std::io::Error),

    #[error("failed to decompress frame: {0}")]
    Decompress(std::io::Error),

    #[error("frame too short: {len} bytes after decompression, need at least 36")]
    TooShort { len: usize },

    #[error("frame does not start with a valid request id")]
    BadId,

    /// Decompression failed after the id was recovered.
    #[error("frame for {id} is corrupt: {source}")]
    Corrupt { id: RequestId, source: std::io::Error },

    #[error("frame for {id} decompresses past the {limit} byte limit")]
    TooLarge { id: RequestId, limit: usize },
}

impl FrameError {
    /// Request id parsed before the failure, if any. The caller can still
    /// fail the pending entry for it instead of leaving it waiting.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Corrupt { id, .. } | Self::TooLarge { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Encodes and decodes frame bodies.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    level: i32,
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(level: i32, max_frame_bytes: usize) -> Self {
        Self {
            level,
            max_frame_bytes,
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Length-prefix codec for a `FramedRead`/`FramedWrite` over a byte stream.
    pub fn framing(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(self.max_frame_bytes)
            .new_codec()
    }

    /// `compress(id ++ payload)`.
    pub fn encode(&self, id: RequestId, payload: &[u8]) -> Result<Bytes, FrameError> {
        let mut body = Vec::with_capacity(REQUEST_ID_LEN + payload.len());
        body.extend_from_slice(&id.to_wire());
        body.extend_from_slice(payload);

        let compressed =
            zstd::stream::encode_all(body.as_slice(), self.level).map_err(FrameError::Compress)?;
        tracing::trace!(
            request_id = %id,
            raw_bytes = body.len(),
            compressed_bytes = compressed.len(),
            "Encoded frame"
        );
        Ok(Bytes::from(compressed))
    }

    /// Decompress, then split off the 36-byte id.
    ///
    /// The decompressed body is capped at `max_frame_bytes`, the same ceiling
    /// the framing puts on the compressed frame.
    pub fn decode(&self, frame: &[u8]) -> Result<Frame, FrameError> {
        let mut decoder = zstd::stream::read::Decoder::new(frame).map_err(FrameError::Decompress)?;

        let mut head = Vec::with_capacity(REQUEST_ID_LEN);
        (&mut decoder)
            .take(REQUEST_ID_LEN as u64)
            .read_to_end(&mut head)
            .map_err(FrameError::Decompress)?;
        if head.len() < REQUEST_ID_LEN {
            return Err(FrameError::TooShort { len: head.len() });
        }
        let id = RequestId::from_wire(&head).ok_or(FrameError::BadId)?;

        let limit = self.max_frame_bytes.saturating_sub(REQUEST_ID_LEN);
        let mut payload = Vec::new();
        (&mut decoder)
            .take(limit as u64 + 1)
            .read_to_end(&mut payload)
            .map_err(|source| FrameError::Corrupt { id, source })?;
        if payload.len() > limit {
            return Err(FrameError::TooLarge {
                id,
                limit: self.max_frame_bytes,
            });
        }

        Ok(Frame {
            id,
            payload: Bytes::from(payload),
        })
    }
}
