//! Packet codec for rpcmux.
//!
//! The smallest unit on the wire is a tagged frame:
//! - 1 kind byte (`1` = UTF-8 text, `2` = raw binary)
//! - a varint32 payload length, so small messages cost few bytes
//! - the payload
//!
//! Encoding allocates a fresh buffer per call; decoding never panics on
//! hostile input and reports [`FrameError::Malformed`] instead.

pub mod codec;
pub mod error;
pub mod varint;

pub use codec::{
    decode, decode_with_config, encode, Frame, FrameConfig, FrameKind, DEFAULT_MAX_PAYLOAD,
    KIND_BINARY, KIND_TEXT,
};
pub use error::{FrameError, Result};
pub use varint::{get_varint32, put_varint32, varint32_len, MAX_VARINT32_LEN};
