//! Master-side key authority.
//!
//! Answers `_auth` requests and owns the session key every accepted minion
//! shares. Minion keys live on disk as hex public keys, one file per id:
//!
//!   <pki_dir>/minions/<id>           accepted
//!   <pki_dir>/minions_pre/<id>       waiting for an operator
//!   <pki_dir>/minions_rejected/<id>  refused
//!   <pki_dir>/minions_denied/<id>    key presented that did not match the stored one

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use parking_lot::RwLock;
use serde_json::{json, Value};

use saltline_core::config::AuthConfig;
use saltline_core::crypto::{self, Crypticle, CryptoError, Keypair, SigningKeypair};
use saltline_core::payload::Load;

use crate::error::AuthError;

pub const MASTER_KEY_FILE: &str = "master.key";
pub const MASTER_SIGN_KEY_FILE: &str = "master_sign.key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Accepted,
    Pending,
    Rejected,
    Denied,
}

impl KeyState {
    fn dir_name(self) -> &'static str {
        match self {
            KeyState::Accepted => "minions",
            KeyState::Pending => "minions_pre",
            KeyState::Rejected => "minions_rejected",
            KeyState::Denied => "minions_denied",
        }
    }

    const ALL: [KeyState; 4] = [
        KeyState::Accepted,
        KeyState::Pending,
        KeyState::Rejected,
        KeyState::Denied,
    ];
}

pub struct KeyAuthority {
    pki_dir: PathBuf,
    opts: AuthConfig,
    keypair: Keypair,
    signing: Option<SigningKeypair>,
    session: RwLock<Arc<Crypticle>>,
    auth_requests: AtomicU64,
}

impl KeyAuthority {
    /// Open (creating as needed) the key stores under `pki_dir`. The session
    /// key is generated fresh on every start.
    pub fn new(pki_dir: &Path, opts: AuthConfig, sign_publishes: bool) -> Result<Self, AuthError> {
        for state in KeyState::ALL {
            std::fs::create_dir_all(pki_dir.join(state.dir_name())).map_err(CryptoError::from)?;
        }
        let keypair = Keypair::load_or_generate(&pki_dir.join(MASTER_KEY_FILE))?;
        let signing = if sign_publishes {
            Some(SigningKeypair::load_or_generate(&pki_dir.join(MASTER_SIGN_KEY_FILE))?)
        } else {
            None
        };
        tracing::info!(
            pki_dir = %pki_dir.display(),
            public_key = %keypair.public_hex(),
            open_mode = opts.open_mode,
            auto_accept = opts.auto_accept,
            "key authority ready"
        );
        Ok(Self {
            pki_dir: pki_dir.to_path_buf(),
            opts,
            keypair,
            signing,
            session: RwLock::new(Arc::new(Crypticle::generate())),
            auth_requests: AtomicU64::new(0),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Current session cipher.
    pub fn session(&self) -> Arc<Crypticle> {
        self.session.read().clone()
    }

    /// Replace the session key. Minions re-authenticate on their next request.
    pub fn rotate_session_key(&self) {
        *self.session.write() = Arc::new(Crypticle::generate());
        tracing::info!("session key rotated");
    }

    pub fn signs_publishes(&self) -> bool {
        self.signing.is_some()
    }

    pub fn signing_public(&self) -> Option<[u8; 32]> {
        self.signing.as_ref().map(SigningKeypair::public)
    }

    pub fn sign(&self, message: &[u8]) -> Option<[u8; 64]> {
        self.signing.as_ref().map(|s| s.sign(message))
    }

    /// Number of `_auth` requests answered since start.
    pub fn auth_requests(&self) -> u64 {
        self.auth_requests.load(Ordering::Relaxed)
    }

    // ── Key stores ────────────────────────────────────────────────────────────

    fn key_path(&self, state: KeyState, id: &str) -> PathBuf {
        self.pki_dir.join(state.dir_name()).join(id)
    }

    fn read_key(&self, state: KeyState, id: &str) -> Option<[u8; 32]> {
        let text = std::fs::read_to_string(self.key_path(state, id)).ok()?;
        crypto::public_from_hex(&text).ok()
    }

    fn write_key(&self, state: KeyState, id: &str, public: &[u8; 32]) -> std::io::Result<()> {
        std::fs::write(self.key_path(state, id), hex::encode(public))
    }

    pub fn accepted_key(&self, id: &str) -> Option<[u8; 32]> {
        valid_id(id).then(|| self.read_key(KeyState::Accepted, id)).flatten()
    }

    pub fn state_of(&self, id: &str) -> Option<KeyState> {
        if !valid_id(id) {
            return None;
        }
        KeyState::ALL
            .into_iter()
            .find(|s| self.key_path(*s, id).exists())
    }

    pub fn list(&self, state: KeyState) -> Vec<String> {
        let mut ids: Vec<String> = std::fs::read_dir(self.pki_dir.join(state.dir_name()))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Move a pending key to accepted. Returns false if `id` was not pending.
    pub fn accept(&self, id: &str) -> Result<bool, AuthError> {
        self.move_key(id, KeyState::Pending, KeyState::Accepted)
    }

    /// Move a pending or accepted key to rejected.
    pub fn reject(&self, id: &str) -> Result<bool, AuthError> {
        if self.move_key(id, KeyState::Pending, KeyState::Rejected)? {
            return Ok(true);
        }
        self.move_key(id, KeyState::Accepted, KeyState::Rejected)
    }

    fn move_key(&self, id: &str, from: KeyState, to: KeyState) -> Result<bool, AuthError> {
        if !valid_id(id) || !self.key_path(from, id).exists() {
            return Ok(false);
        }
        std::fs::rename(self.key_path(from, id), self.key_path(to, id)).map_err(CryptoError::from)?;
        tracing::info!(id, from = ?from, to = ?to, "minion key moved");
        Ok(true)
    }

    // ── _auth ─────────────────────────────────────────────────────────────────

    /// Answer a clear `_auth` load. Never fails: refusals are encoded in `ret`.
    pub fn handle_auth(&self, load: &Load) -> Value {
        self.auth_requests.fetch_add(1, Ordering::Relaxed);

        let id = match load.get("id").and_then(Value::as_str) {
            Some(id) if valid_id(id) => id,
            other => {
                tracing::warn!(id = ?other, "auth request with invalid id");
                return json!({"ret": false});
            }
        };
        let presented = match load.get("pub").and_then(Value::as_str).map(crypto::public_from_hex) {
            Some(Ok(key)) => key,
            _ => {
                tracing::warn!(id, "auth request with malformed public key");
                return json!({"ret": false});
            }
        };

        match self.decide(id, &presented) {
            Ok(Decision::Accept) => self.accept_reply(id, &presented),
            Ok(Decision::Pending) => json!({"ret": "pending"}),
            Ok(Decision::Full) => json!({"ret": "full"}),
            Ok(Decision::Refuse) => json!({"ret": false}),
            Err(e) => {
                tracing::error!(id, error = %e, "key store failure during auth");
                json!({"ret": false})
            }
        }
    }

    fn decide(&self, id: &str, presented: &[u8; 32]) -> std::io::Result<Decision> {
        let open = self.opts.open_mode;

        if let Some(stored) = self.read_key(KeyState::Accepted, id) {
            if &stored == presented {
                return Ok(Decision::Accept);
            }
            if open {
                self.write_key(KeyState::Accepted, id, presented)?;
                return Ok(Decision::Accept);
            }
            tracing::warn!(id, "presented key does not match accepted key");
            self.write_key(KeyState::Denied, id, presented)?;
            return Ok(Decision::Refuse);
        }

        if self.key_path(KeyState::Rejected, id).exists() && !open {
            tracing::info!(id, "auth from rejected minion");
            return Ok(Decision::Refuse);
        }

        if let Some(stored) = self.read_key(KeyState::Pending, id) {
            if &stored != presented && !open {
                tracing::warn!(id, "presented key does not match pending key");
                self.write_key(KeyState::Denied, id, presented)?;
                return Ok(Decision::Refuse);
            }
            if open || self.opts.auto_accept {
                std::fs::remove_file(self.key_path(KeyState::Pending, id))?;
                return self.admit(id, presented);
            }
            return Ok(Decision::Pending);
        }

        if open || self.opts.auto_accept {
            return self.admit(id, presented);
        }
        self.write_key(KeyState::Pending, id, presented)?;
        tracing::info!(id, "new minion key pending acceptance");
        Ok(Decision::Pending)
    }

    fn admit(&self, id: &str, presented: &[u8; 32]) -> std::io::Result<Decision> {
        if self.opts.max_minions > 0 && self.list(KeyState::Accepted).len() >= self.opts.max_minions {
            tracing::warn!(id, max = self.opts.max_minions, "minion limit reached");
            return Ok(Decision::Full);
        }
        if self.key_path(KeyState::Rejected, id).exists() {
            std::fs::remove_file(self.key_path(KeyState::Rejected, id))?;
        }
        self.write_key(KeyState::Accepted, id, presented)?;
        tracing::info!(id, "minion key accepted");
        Ok(Decision::Accept)
    }

    fn accept_reply(&self, id: &str, minion_pub: &[u8; 32]) -> Value {
        let session = self.session();
        let key = session.key_bytes();
        let sealed = match crypto::seal(&self.keypair, minion_pub, &*key) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!(id, error = %e, "failed to seal session key");
                return json!({"ret": false});
            }
        };
        let mut reply = json!({
            "ret": true,
            "aes": B64.encode(sealed),
            "pub_key": self.keypair.public_hex(),
            "token": crypto::keyed_token(&key, id.as_bytes()),
        });
        if let Some(signing) = &self.signing {
            reply["sign_pub"] = Value::String(hex::encode(signing.public()));
        }
        reply
    }

    /// Encrypt `value` with a one-off key sealed to `target`'s accepted key.
    /// Returns `(sealed key, ciphertext)`.
    pub fn seal_private(
        &self,
        target: &str,
        value: &Value,
        nonce: Option<&str>,
    ) -> Result<(Vec<u8>, Vec<u8>), AuthError> {
        let target_pub = self
            .accepted_key(target)
            .ok_or_else(|| AuthError::Malformed(format!("no accepted key for {target}")))?;
        let one_off = Crypticle::generate();
        let sealed_key = crypto::seal(&self.keypair, &target_pub, &*one_off.key_bytes())?;
        let ciphertext = one_off.dumps(value, nonce)?;
        Ok((sealed_key, ciphertext))
    }
}

enum Decision {
    Accept,
    Pending,
    Full,
    Refuse,
}

/// Ids name files in the key stores.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
}
