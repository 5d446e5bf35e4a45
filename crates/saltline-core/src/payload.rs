//! Loads and payloads — the two JSON shapes every channel speaks.
//!
//! A `Load` is the caller's request or publish body. A `Payload` wraps a load
//! for the wire and states whether it travels in the clear or encrypted:
//!
//!   {"enc": "clear", "load": {...}}
//!   {"enc": "aes",   "load": "<base64 ciphertext>", "version": 2}
//!
//! Ciphertext is always base64 inside JSON.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Caller-supplied mapping. Conventionally carries `cmd` or `fun`.
pub type Load = serde_json::Map<String, Value>;

/// Current payload version. Version 2 and above carry a request nonce inside
/// the encrypted load.
pub const PAYLOAD_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enc {
    Clear,
    Aes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub enc: Enc,
    pub load: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Base64 Ed25519 signature over the raw ciphertext. Publishes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encrypted load is not a base64 string")]
    NotCiphertext,
    #[error("signature is not valid base64")]
    BadSignature,
}

impl Payload {
    pub fn clear(load: Load) -> Self {
        Self {
            enc: Enc::Clear,
            load: Value::Object(load),
            version: None,
            sig: None,
        }
    }

    pub fn aes(ciphertext: &[u8]) -> Self {
        Self {
            enc: Enc::Aes,
            load: Value::String(B64.encode(ciphertext)),
            version: Some(PAYLOAD_VERSION),
            sig: None,
        }
    }

    pub fn with_signature(mut self, sig: &[u8]) -> Self {
        self.sig = Some(B64.encode(sig));
        self
    }

    /// Parse a payload out of a decoded frame body.
    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Value {
        // Payload holds only JSON-representable fields.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Raw ciphertext of an `aes` payload.
    pub fn ciphertext(&self) -> Result<Vec<u8>, PayloadError> {
        match &self.load {
            Value::String(s) => B64.decode(s).map_err(|_| PayloadError::NotCiphertext),
            _ => Err(PayloadError::NotCiphertext),
        }
    }

    pub fn signature(&self) -> Result<Option<Vec<u8>>, PayloadError> {
        self.sig
            .as_deref()
            .map(|s| B64.decode(s).map_err(|_| PayloadError::BadSignature))
            .transpose()
    }

    /// Whether this payload carries a request nonce inside its load.
    pub fn has_nonce(&self) -> bool {
        self.version.unwrap_or(0) > 1
    }
}

/// Build a load from `key=value` pairs. Values that parse as JSON are kept
/// typed, everything else becomes a string.
pub fn load_from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Load {
    pairs
        .into_iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.to_string()));
            (k.to_string(), value)
        })
        .collect()
}
