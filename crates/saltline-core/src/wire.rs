//! Saltline wire format.
//!
//! Every frame on every transport is a fixed 8-byte header followed by a
//! JSON envelope:
//!
//!   [magic "SL" (2)] [version (1)] [flags (1)] [body length u32 LE (4)]
//!   {"head": {...}, "body": <payload>}
//!
//! The head carries routing data: `mid` (request correlation id) on request
//! streams, `topic_lst` on publishes, `id` on subscriber hellos. The body is
//! a `Payload` or a reply value.
//!
//! The header is `#[repr(C, packed)]` with zerocopy derives. There is no
//! unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const MAGIC: [u8; 2] = *b"SL";
pub const WIRE_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();
/// Largest body a receiver will allocate for.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Head key holding the request correlation id.
pub const HEAD_MID: &str = "mid";
/// Head key holding the publish topic list.
pub const HEAD_TOPICS: &str = "topic_lst";
/// Head key holding a subscriber's node id.
pub const HEAD_ID: &str = "id";

// ── Frame Header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub magic: [u8; 2],
    /// Receivers drop frames with an unknown version.
    pub version: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    /// Body length, little-endian.
    pub length: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub fn new(body_len: u32) -> Self {
        Self {
            magic: MAGIC,
            version: WIRE_VERSION,
            flags: 0,
            length: body_len.to_le_bytes(),
        }
    }

    /// Validate a raw header and return the body length it announces.
    pub fn parse(raw: &[u8]) -> Result<usize, WireError> {
        let header = FrameHeader::read_from_prefix(raw).ok_or(WireError::Truncated)?;
        if header.magic != MAGIC {
            return Err(WireError::BadMagic);
        }
        if header.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let len = u32::from_le_bytes(header.length) as usize;
        if len > MAX_BODY_LEN {
            return Err(WireError::TooLarge(len));
        }
        Ok(len)
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub head: Map<String, Value>,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    pub fn new(body: Value) -> Self {
        Self {
            head: Map::new(),
            body,
        }
    }

    pub fn with_head(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.head.insert(key.to_string(), value.into());
        self
    }

    pub fn mid(&self) -> Option<&str> {
        self.head.get(HEAD_MID).and_then(Value::as_str)
    }

    /// Topic list attached to a publish, if any.
    pub fn topics(&self) -> Option<Vec<&str>> {
        self.head
            .get(HEAD_TOPICS)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
    }

    /// Header plus JSON body, ready for the wire.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_BODY_LEN {
            return Err(WireError::TooLarge(body.len()));
        }
        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_slice(FrameHeader::new(body.len() as u32).as_bytes());
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode one complete frame. Trailing bytes are an error.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let len = FrameHeader::parse(frame)?;
        let body = &frame[HEADER_LEN..];
        if body.len() != len {
            return Err(WireError::LengthMismatch {
                expected: len,
                actual: body.len(),
            });
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// Frame a bare body with no head entries.
pub fn frame_msg(body: Value) -> Result<Bytes, WireError> {
    Envelope::new(body).encode()
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame shorter than header")]
    Truncated,
    #[error("bad frame magic")]
    BadMagic,
    #[error("unknown wire version {0:#04x}")]
    UnknownVersion(u8),
    #[error("frame body of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("frame announces {expected} body bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}
