//! Cryptographic primitives for saltline.
//!
//! Provides:
//!   1. BLAKE3 hashing: correlation ids, auth tokens, key derivation
//!   2. `Crypticle`: the symmetric session cipher (ChaCha20-Poly1305)
//!   3. X25519 node keypairs and sealed key transfer between two keypairs
//!   4. Ed25519 publish signing
//!   5. A sliding replay window over publish serials
//!
//! All key material is held in `Zeroizing` buffers. There is no unsafe code
//! in this module.

use std::path::Path;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex token binding `data` to a secret key.
pub fn keyed_token(key: &[u8; 32], data: &[u8]) -> String {
    hex::encode(blake3::keyed_hash(key, data).as_bytes())
}

/// Random 32-character hex nonce, echoed inside encrypted replies.
pub fn request_nonce() -> String {
    let mut raw = [0u8; NONCE_LEN / 2];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

// ── Crypticle ─────────────────────────────────────────────────────────────────

/// Plaintext marker checked after every decrypt.
const PAD: &[u8] = b"saltline::";
/// Length of a request nonce in bytes (hex characters).
pub const NONCE_LEN: usize = 32;
const AEAD_NONCE_LEN: usize = 12;

/// Symmetric cipher for session traffic.
///
/// Ciphertext layout: `[12-byte AEAD nonce] [ChaCha20-Poly1305 ciphertext + tag]`.
/// The sealed plaintext of `dumps` is `PAD || request nonce? || json`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Crypticle {
    key: Zeroizing<[u8; 32]>,
}

impl Crypticle {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::from_key(key)
    }

    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 32] = key.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self::from_key(key))
    }

    pub fn key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*self.key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(AEAD_NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if data.len() < AEAD_NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*self.key));
        let (nonce, sealed) = data.split_at(AEAD_NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Serialize and encrypt a value, optionally binding a request nonce.
    pub fn dumps(&self, value: &Value, nonce: Option<&str>) -> Result<Vec<u8>, CryptoError> {
        let json = serde_json::to_vec(value)?;
        let mut plain = Zeroizing::new(Vec::with_capacity(PAD.len() + NONCE_LEN + json.len()));
        plain.extend_from_slice(PAD);
        if let Some(nonce) = nonce {
            if nonce.len() != NONCE_LEN {
                return Err(CryptoError::BadNonce);
            }
            plain.extend_from_slice(nonce.as_bytes());
        }
        plain.extend_from_slice(&json);
        self.encrypt(&plain)
    }

    /// Decrypt and deserialize. When `nonce` is given, the sealed nonce must
    /// match it exactly.
    pub fn loads(&self, data: &[u8], nonce: Option<&str>) -> Result<Value, CryptoError> {
        let plain = self.decrypt(data)?;
        let mut rest = plain.strip_prefix(PAD).ok_or(CryptoError::BadPad)?;
        if let Some(expected) = nonce {
            if rest.len() < NONCE_LEN || &rest[..NONCE_LEN] != expected.as_bytes() {
                return Err(CryptoError::NonceMismatch);
            }
            rest = &rest[NONCE_LEN..];
        }
        Ok(serde_json::from_slice(rest)?)
    }
}

impl std::fmt::Debug for Crypticle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Crypticle(..)")
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term X25519 keypair.
///
/// Masters and minions each hold one. The public half is what the master's
/// key store records per minion id.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_private(secret.to_bytes())
    }

    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public)
    }

    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let secret = StaticSecret::from(*self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        Zeroizing::new(*shared.as_bytes())
    }

    /// Load the hex private key at `path`, generating and storing a new one
    /// if the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        load_or_generate_secret(path).map(Self::from_private)
    }
}

/// Parse a 32-byte public key from hex.
pub fn public_from_hex(text: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(text.trim()).map_err(|_| CryptoError::BadKey)?;
    bytes.try_into().map_err(|_| CryptoError::BadKey)
}

fn load_or_generate_secret(path: &Path) -> Result<[u8; 32], CryptoError> {
    if path.exists() {
        let text = std::fs::read_to_string(path)?;
        return public_from_hex(&text);
    }
    let mut secret = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *secret);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(*secret))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(*secret)
}

// ── Sealed key transfer ───────────────────────────────────────────────────────

const SEAL_CONTEXT: &str = "saltline 2024-06 sealed key transfer v1";

fn sealing_cipher(shared: &[u8; 32]) -> Crypticle {
    Crypticle::from_key(blake3::derive_key(SEAL_CONTEXT, shared))
}

/// Encrypt `plaintext` so only the holder of `recipient`'s private key can
/// open it, given the sender's public key.
pub fn seal(sender: &Keypair, recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    sealing_cipher(&sender.diffie_hellman(recipient)).encrypt(plaintext)
}

pub fn open(
    recipient: &Keypair,
    sender: &[u8; 32],
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    sealing_cipher(&recipient.diffie_hellman(sender)).decrypt(sealed)
}

// ── Publish signing ───────────────────────────────────────────────────────────

/// Ed25519 key the master signs publishes with.
pub struct SigningKeypair {
    key: ed25519_dalek::SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self {
            key: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        let secret = load_or_generate_secret(path)?;
        Ok(Self {
            key: ed25519_dalek::SigningKey::from_bytes(&secret),
        })
    }

    pub fn public(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(public).map_err(|_| CryptoError::BadKey)?;
    let sig = ed25519_dalek::Signature::from_slice(signature).map_err(|_| CryptoError::Signature)?;
    key.verify(message, &sig).map_err(|_| CryptoError::Signature)
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Number of serials tracked behind the highest one seen.
const WINDOW_SIZE: u64 = 2048;
const WINDOW_WORDS: usize = (WINDOW_SIZE / 64) as usize;

/// Ring-bitmap replay filter over publish serials.
///
/// Serials more than `WINDOW_SIZE` behind the highest seen are rejected as
/// stale; serials inside the window are rejected if already marked.
pub struct ReplayWindow {
    highest: Option<u64>,
    bits: [u64; WINDOW_WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: None,
            bits: [0; WINDOW_WORDS],
        }
    }

    fn slot(serial: u64) -> (usize, u64) {
        let i = serial % WINDOW_SIZE;
        ((i / 64) as usize, 1u64 << (i % 64))
    }

    pub fn check(&self, serial: u64) -> bool {
        match self.highest {
            None => true,
            Some(h) if serial > h => true,
            Some(h) if h - serial >= WINDOW_SIZE => false,
            Some(_) => {
                let (word, mask) = Self::slot(serial);
                self.bits[word] & mask == 0
            }
        }
    }

    pub fn mark(&mut self, serial: u64) {
        match self.highest {
            Some(h) if serial <= h => {
                if h - serial >= WINDOW_SIZE {
                    return;
                }
            }
            Some(h) if serial - h >= WINDOW_SIZE => {
                self.bits = [0; WINDOW_WORDS];
                self.highest = Some(serial);
            }
            Some(h) => {
                for s in h + 1..=serial {
                    let (word, mask) = Self::slot(s);
                    self.bits[word] &= !mask;
                }
                self.highest = Some(serial);
            }
            None => self.highest = Some(serial),
        }
        let (word, mask) = Self::slot(serial);
        self.bits[word] |= mask;
    }

    /// Check and mark in one step. Returns false for a replay.
    pub fn accept(&mut self, serial: u64) -> bool {
        if !self.check(serial) {
            return false;
        }
        self.mark(serial);
        true
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("decrypted payload has an invalid pad")]
    BadPad,
    #[error("request nonce must be {NONCE_LEN} characters")]
    BadNonce,
    #[error("nonce verification error")]
    NonceMismatch,
    #[error("invalid key material")]
    BadKey,
    #[error("signature verification failed")]
    Signature,
    #[error("key file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("sealed value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}
