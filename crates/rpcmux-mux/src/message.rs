//! Channel control messages.
//!
//! Every frame on a multiplexed transport carries exactly one
//! [`ChannelMessage`]. Messages with binary content travel in Binary frames
//! using a compact field layout; everything else is JSON in a Text frame.
//! Both encodings are accepted on receive.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rpcmux_frame::{get_varint32, put_varint32, Frame};
use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// Channel lifecycle message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Open,
    Ready,
    Data,
    Close,
    Error,
    Ping,
    Pong,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageKind::Open => 1,
            MessageKind::Ready => 2,
            MessageKind::Data => 3,
            MessageKind::Close => 4,
            MessageKind::Error => 5,
            MessageKind::Ping => 6,
            MessageKind::Pong => 7,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => MessageKind::Open,
            2 => MessageKind::Ready,
            3 => MessageKind::Data,
            4 => MessageKind::Close,
            5 => MessageKind::Error,
            6 => MessageKind::Ping,
            7 => MessageKind::Pong,
            other => {
                return Err(MuxError::Malformed(format!(
                    "unknown control message kind {other}"
                )))
            }
        })
    }
}

/// Channel data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes.as_ref(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

/// One multiplexing control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub kind: MessageKind,
    pub client_id: String,
    pub id: String,
    /// Present on `open` and `ready`.
    pub path: Option<String>,
    /// Present on `data`.
    pub content: Option<Payload>,
    /// Present on `error`.
    pub code: Option<u32>,
    /// Present on `close` (optional) and `error`.
    pub reason: Option<String>,
}

impl ChannelMessage {
    fn bare(kind: MessageKind, client_id: &str, id: &str) -> Self {
        Self {
            kind,
            client_id: client_id.to_owned(),
            id: id.to_owned(),
            path: None,
            content: None,
            code: None,
            reason: None,
        }
    }

    pub fn open(client_id: &str, id: &str, path: &str) -> Self {
        Self {
            path: Some(path.to_owned()),
            ..Self::bare(MessageKind::Open, client_id, id)
        }
    }

    pub fn ready(client_id: &str, id: &str, path: &str) -> Self {
        Self {
            path: Some(path.to_owned()),
            ..Self::bare(MessageKind::Ready, client_id, id)
        }
    }

    pub fn data(client_id: &str, id: &str, content: Payload) -> Self {
        Self {
            content: Some(content),
            ..Self::bare(MessageKind::Data, client_id, id)
        }
    }

    pub fn close(client_id: &str, id: &str, reason: Option<&str>) -> Self {
        Self {
            reason: reason.map(str::to_owned),
            ..Self::bare(MessageKind::Close, client_id, id)
        }
    }

    pub fn error(client_id: &str, id: &str, code: u32, reason: &str) -> Self {
        Self {
            code: Some(code),
            reason: Some(reason.to_owned()),
            ..Self::bare(MessageKind::Error, client_id, id)
        }
    }

    pub fn ping(client_id: &str, nonce: &str) -> Self {
        Self::bare(MessageKind::Ping, client_id, nonce)
    }

    pub fn pong(client_id: &str, nonce: &str) -> Self {
        Self::bare(MessageKind::Pong, client_id, nonce)
    }

    /// Wrap this message in a frame: Binary for binary content, Text (JSON)
    /// otherwise.
    pub fn to_frame(&self) -> Result<Frame> {
        match &self.content {
            Some(Payload::Binary(bytes)) => {
                if bytes.len() > u32::MAX as usize {
                    return Err(MuxError::Malformed(format!(
                        "binary content too large: {} bytes",
                        bytes.len()
                    )));
                }
                Ok(Frame::Binary(self.encode_compact()))
            }
            _ => {
                let wire = WireMessageRef {
                    kind: self.kind,
                    client_id: &self.client_id,
                    id: &self.id,
                    path: self.path.as_deref(),
                    content: self.content.as_ref().and_then(Payload::as_text),
                    code: self.code,
                    reason: self.reason.as_deref(),
                };
                Ok(Frame::Text(serde_json::to_string(&wire)?))
            }
        }
    }

    /// Encode straight to wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(rpcmux_frame::encode(&self.to_frame()?)?)
    }

    /// Parse a control message out of a decoded frame.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Text(text) => {
                let wire: WireMessage = serde_json::from_str(&text)?;
                Ok(wire.into())
            }
            Frame::Binary(bytes) => Self::decode_compact(&bytes),
        }
    }

    fn encode_compact(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind.as_byte());
        put_str(&mut buf, &self.client_id);
        put_str(&mut buf, &self.id);
        match self.kind {
            MessageKind::Open | MessageKind::Ready => {
                put_str(&mut buf, self.path.as_deref().unwrap_or_default());
            }
            MessageKind::Data => {
                let content = self.content.as_ref().map(Payload::as_bytes);
                put_bytes(&mut buf, content.unwrap_or_default());
            }
            MessageKind::Close => {
                put_str(&mut buf, self.reason.as_deref().unwrap_or_default());
            }
            MessageKind::Error => {
                buf.put_u32(self.code.unwrap_or_default());
                put_str(&mut buf, self.reason.as_deref().unwrap_or_default());
            }
            MessageKind::Ping | MessageKind::Pong => {}
        }
        buf.freeze()
    }

    fn decode_compact(src: &[u8]) -> Result<Self> {
        let mut cursor = src;
        if !cursor.has_remaining() {
            return Err(MuxError::Malformed("empty control message".to_string()));
        }
        let kind = MessageKind::from_byte(cursor.get_u8())?;
        let client_id = get_str(&mut cursor)?;
        let id = get_str(&mut cursor)?;
        let mut message = Self::bare(kind, &client_id, &id);

        match kind {
            MessageKind::Open | MessageKind::Ready => {
                message.path = Some(get_str(&mut cursor)?);
            }
            MessageKind::Data => {
                message.content = Some(Payload::Binary(get_bytes(&mut cursor)?));
            }
            MessageKind::Close => {
                message.reason = Some(get_str(&mut cursor)?).filter(|r| !r.is_empty());
            }
            MessageKind::Error => {
                if cursor.remaining() < 4 {
                    return Err(MuxError::Malformed("truncated error code".to_string()));
                }
                message.code = Some(cursor.get_u32());
                message.reason = Some(get_str(&mut cursor)?);
            }
            MessageKind::Ping | MessageKind::Pong => {}
        }

        if cursor.has_remaining() {
            return Err(MuxError::Malformed(format!(
                "{} trailing bytes in control message",
                cursor.remaining()
            )));
        }
        Ok(message)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessageRef<'a> {
    kind: MessageKind,
    client_id: &'a str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    kind: MessageKind,
    client_id: String,
    id: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    reason: Option<String>,
}

impl From<WireMessage> for ChannelMessage {
    fn from(wire: WireMessage) -> Self {
        Self {
            kind: wire.kind,
            client_id: wire.client_id,
            id: wire.id,
            path: wire.path,
            content: wire.content.map(Payload::Text),
            code: wire.code,
            reason: wire.reason,
        }
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_varint32(buf, value.len() as u32);
    buf.put_slice(value);
}

fn get_bytes(cursor: &mut &[u8]) -> Result<Bytes> {
    let len = get_varint32(cursor)? as usize;
    if cursor.remaining() < len {
        return Err(MuxError::Malformed(format!(
            "field length {len} exceeds remaining {} bytes",
            cursor.remaining()
        )));
    }
    Ok(cursor.copy_to_bytes(len))
}

fn get_str(cursor: &mut &[u8]) -> Result<String> {
    let bytes = get_bytes(cursor)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|err| MuxError::Malformed(format!("field is not UTF-8: {err}")))
}
