use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::varint::{get_varint32, put_varint32, varint32_len};

/// Kind byte for UTF-8 text frames.
pub const KIND_TEXT: u8 = 1;

/// Kind byte for raw binary frames.
pub const KIND_BINARY: u8 = 2;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Text,
    Binary,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Text => KIND_TEXT,
            FrameKind::Binary => KIND_BINARY,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            KIND_TEXT => Ok(FrameKind::Text),
            KIND_BINARY => Ok(FrameKind::Binary),
            other => Err(FrameError::malformed(format!("unknown frame kind {other}"))),
        }
    }
}

/// The atomic unit carried by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Text(_) => FrameKind::Text,
            Frame::Binary(_) => FrameKind::Binary,
        }
    }

    /// Payload bytes regardless of kind.
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes.as_ref(),
        }
    }

    /// The total wire size of this frame (kind + length prefix + payload).
    pub fn wire_size(&self) -> usize {
        let len = self.payload().len();
        1 + varint32_len(len.min(u32::MAX as usize) as u32) + len
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Encode a frame into a freshly allocated buffer.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────────────┬─────────────────┐
/// │ Kind (1B)  │ Length (varint32)│ Payload         │
/// │ 1=Text     │ 1..=5 bytes      │ (Length bytes)  │
/// │ 2=Binary   │                  │                 │
/// └────────────┴──────────────────┴─────────────────┘
/// ```
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let payload = frame.payload();
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    let mut dst = BytesMut::with_capacity(frame.wire_size());
    dst.put_u8(frame.kind().as_byte());
    put_varint32(&mut dst, payload.len() as u32);
    dst.put_slice(payload);
    Ok(dst.freeze())
}

/// Decode exactly one frame from `src` with the default configuration.
pub fn decode(src: &[u8]) -> Result<Frame> {
    decode_with_config(src, &FrameConfig::default())
}

/// Decode exactly one frame from `src`.
///
/// The input must contain one complete frame and nothing else; anything
/// else is reported as [`FrameError::Malformed`].
pub fn decode_with_config(src: &[u8], config: &FrameConfig) -> Result<Frame> {
    let mut cursor = src;
    if !cursor.has_remaining() {
        return Err(FrameError::malformed("empty input"));
    }
    let kind = FrameKind::try_from(cursor.get_u8())?;
    let len = get_varint32(&mut cursor)? as usize;

    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }
    if cursor.remaining() < len {
        return Err(FrameError::malformed(format!(
            "declared length {len} exceeds remaining {} bytes",
            cursor.remaining()
        )));
    }
    if cursor.remaining() > len {
        return Err(FrameError::malformed(format!(
            "{} trailing bytes after payload",
            cursor.remaining() - len
        )));
    }

    let payload = &cursor[..len];
    match kind {
        FrameKind::Text => {
            let text = std::str::from_utf8(payload)
                .map_err(|err| FrameError::malformed(format!("text frame is not UTF-8: {err}")))?;
            Ok(Frame::Text(text.to_owned()))
        }
        FrameKind::Binary => Ok(Frame::Binary(Bytes::copy_from_slice(payload))),
    }
}
