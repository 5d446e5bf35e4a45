//! Client-side authentication.
//!
//! A minion proves its identity by sending its public key in a clear `_auth`
//! request. If the master accepts the key it answers with the session key
//! sealed to that public key, the master's own public key, and (when publish
//! signing is on) the key publishes are signed with.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::{json, Value};

use saltline_core::crypto::{self, Crypticle, Keypair};
use saltline_core::payload::Load;

use crate::error::AuthError;

/// Reserved command answered by the master's key authority.
pub const AUTH_CMD: &str = "_auth";
/// File under the pki dir holding a minion's private key.
pub const MINION_KEY_FILE: &str = "minion.key";

/// Result of a successful authentication.
#[derive(Debug)]
pub struct AuthSession {
    pub crypticle: Crypticle,
    pub master_pub: [u8; 32],
    /// Present when the master signs its publishes.
    pub sign_pub: Option<[u8; 32]>,
    pub token: String,
}

pub struct AsyncAuth {
    node_id: String,
    keypair: Keypair,
}

impl AsyncAuth {
    /// Load (or create) this node's keypair under `pki_dir`.
    pub fn new(node_id: &str, pki_dir: &Path) -> Result<Self, AuthError> {
        let keypair = Keypair::load_or_generate(&pki_dir.join(MINION_KEY_FILE))?;
        Ok(Self::with_keypair(node_id, keypair))
    }

    pub fn with_keypair(node_id: &str, keypair: Keypair) -> Self {
        Self {
            node_id: node_id.to_string(),
            keypair,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Load for the clear `_auth` request.
    pub fn auth_request(&self) -> Load {
        let value = json!({
            "cmd": AUTH_CMD,
            "id": self.node_id,
            "pub": self.keypair.public_hex(),
        });
        match value {
            Value::Object(map) => map,
            _ => Load::new(),
        }
    }

    /// Turn the master's auth reply into a session.
    pub fn complete(&self, reply: &Value) -> Result<AuthSession, AuthError> {
        let reply = reply
            .as_object()
            .ok_or_else(|| AuthError::Malformed(format!("expected a mapping, got {reply}")))?;

        match reply.get("ret") {
            Some(Value::Bool(true)) => {}
            Some(Value::Bool(false)) => return Err(AuthError::Rejected),
            Some(Value::String(s)) if s == "pending" => return Err(AuthError::Pending),
            Some(Value::String(s)) if s == "full" => return Err(AuthError::Full),
            other => {
                return Err(AuthError::Malformed(format!(
                    "unexpected ret {}",
                    other.cloned().unwrap_or(Value::Null)
                )))
            }
        }

        let master_pub = hex_field(reply, "pub_key")?;
        let sealed = reply
            .get("aes")
            .and_then(Value::as_str)
            .and_then(|s| B64.decode(s).ok())
            .ok_or_else(|| AuthError::Malformed("missing aes".into()))?;
        let key = crypto::open(&self.keypair, &master_pub, &sealed)?;
        let crypticle = Crypticle::from_slice(&key)?;

        let sign_pub = match reply.get("sign_pub") {
            Some(Value::String(_)) => Some(hex_field(reply, "sign_pub")?),
            _ => None,
        };
        let token = reply
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        tracing::debug!(node = %self.node_id, signed_publishes = sign_pub.is_some(), "authenticated with master");
        Ok(AuthSession {
            crypticle,
            master_pub,
            sign_pub,
            token,
        })
    }

    /// Open a reply produced for this node alone: `{"key": <sealed one-off
    /// key>, <dictkey>: <ciphertext>}`.
    pub fn open_private(
        &self,
        session: &AuthSession,
        reply: &Value,
        dictkey: &str,
        nonce: Option<&str>,
    ) -> Result<Value, AuthError> {
        let field = |name: &str| {
            reply
                .get(name)
                .and_then(Value::as_str)
                .and_then(|s| B64.decode(s).ok())
                .ok_or_else(|| AuthError::Malformed(format!("private reply missing {name}")))
        };
        let sealed_key = field("key")?;
        let ciphertext = field(dictkey)?;
        let key = crypto::open(&self.keypair, &session.master_pub, &sealed_key)
            .map_err(AuthError::Decrypt)?;
        let one_off = Crypticle::from_slice(&key)?;
        one_off.loads(&ciphertext, nonce).map_err(AuthError::Decrypt)
    }
}

fn hex_field(reply: &Load, name: &str) -> Result<[u8; 32], AuthError> {
    reply
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::Malformed(format!("missing {name}")))
        .and_then(|s| crypto::public_from_hex(s).map_err(AuthError::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted_reply(master: &Keypair, minion_pub: &[u8; 32], key: &Crypticle) -> Value {
        let sealed = crypto::seal(master, minion_pub, &*key.key_bytes()).unwrap();
        json!({
            "ret": true,
            "aes": B64.encode(sealed),
            "pub_key": master.public_hex(),
            "token": "t0k",
        })
    }

    #[test]
    fn auth_request_names_node_and_key() {
        let auth = AsyncAuth::with_keypair("web-01", Keypair::generate());
        let load = auth.auth_request();
        assert_eq!(load["cmd"], AUTH_CMD);
        assert_eq!(load["id"], "web-01");
        assert_eq!(load["pub"], auth.keypair().public_hex());
    }

    #[test]
    fn accepted_reply_yields_working_session() {
        let master = Keypair::generate();
        let auth = AsyncAuth::with_keypair("web-01", Keypair::generate());
        let session_key = Crypticle::generate();
        let reply = accepted_reply(&master, &auth.keypair().public, &session_key);

        let session = auth.complete(&reply).unwrap();
        assert_eq!(session.master_pub, master.public);
        assert!(session.sign_pub.is_none());
        assert_eq!(session.token, "t0k");

        let sealed = session_key.dumps(&json!({"ret": "pong"}), None).unwrap();
        assert_eq!(session.crypticle.loads(&sealed, None).unwrap()["ret"], "pong");
    }

    #[test]
    fn refusals_map_to_distinct_errors() {
        let auth = AsyncAuth::with_keypair("web-01", Keypair::generate());
        assert!(matches!(auth.complete(&json!({"ret": false})), Err(AuthError::Rejected)));
        assert!(matches!(auth.complete(&json!({"ret": "pending"})), Err(AuthError::Pending)));
        assert!(matches!(auth.complete(&json!({"ret": "full"})), Err(AuthError::Full)));
        assert!(matches!(auth.complete(&json!("bad load")), Err(AuthError::Malformed(_))));
        assert!(matches!(auth.complete(&json!({"ret": true})), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn key_sealed_for_another_node_fails() {
        let master = Keypair::generate();
        let auth = AsyncAuth::with_keypair("web-01", Keypair::generate());
        let stranger = Keypair::generate();
        let reply = accepted_reply(&master, &stranger.public, &Crypticle::generate());
        assert!(auth.complete(&reply).is_err());
    }

    #[test]
    fn private_reply_opens_with_node_key() {
        let master = Keypair::generate();
        let auth = AsyncAuth::with_keypair("web-01", Keypair::generate());
        let session = auth
            .complete(&accepted_reply(&master, &auth.keypair().public, &Crypticle::generate()))
            .unwrap();

        let one_off = Crypticle::generate();
        let nonce = crypto::request_nonce();
        let reply = json!({
            "key": B64.encode(crypto::seal(&master, &auth.keypair().public, &*one_off.key_bytes()).unwrap()),
            "pillar": B64.encode(one_off.dumps(&json!({"secret": 42}), Some(&nonce)).unwrap()),
        });
        let opened = auth.open_private(&session, &reply, "pillar", Some(&nonce)).unwrap();
        assert_eq!(opened["secret"], 42);
        assert!(auth.open_private(&session, &reply, "other", Some(&nonce)).is_err());
    }
}
