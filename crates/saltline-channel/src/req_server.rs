//! Request server channel.
//!
//! Each inbound frame walks RECEIVED → DECODED → VALIDATED → DISPATCHED →
//! REPLIED. Any step may divert to ERRORED, which still produces a reply:
//! a malformed message never stops the serving loop.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use thiserror::Error;

use saltline_core::crypto::Crypticle;
use saltline_core::payload::{Enc, Load, Payload};
use saltline_core::wire::{Envelope, HEAD_MID};

use crate::auth::AUTH_CMD;
use crate::keys::KeyAuthority;

pub const BAD_LOAD: &str = "bad load";
pub const NOT_A_DICT: &str = "payload and load must be a dict";
pub const ID_NULL_BYTE: &str = "bad load: id contains a null byte";
pub const HANDLER_EXCEPTION: &str = "Some exception handling minion payload";
pub const SERVER_EXCEPTION: &str = "Server-side exception handling payload";

/// Whether a string reply is one of the server's error literals.
pub fn is_error_reply(reply: &str) -> bool {
    reply == BAD_LOAD
        || reply == NOT_A_DICT
        || reply.starts_with("bad load: ")
        || reply == HANDLER_EXCEPTION
        || reply == SERVER_EXCEPTION
}

/// How a handler's return value is sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMode {
    /// As-is, unencrypted.
    Clear,
    /// Encrypted with the session key.
    Standard,
    /// Encrypted with a one-off key only `target` can open; the ciphertext
    /// sits under `dictkey` in the reply.
    Private { dictkey: String, target: String },
}

impl ReplyMode {
    /// Resolve a reply function by name.
    pub fn from_name(name: &str, dictkey: Option<&str>, target: Option<&str>) -> Result<Self, HandlerError> {
        match (name, dictkey, target) {
            ("send_clear", _, _) => Ok(ReplyMode::Clear),
            ("send", _, _) => Ok(ReplyMode::Standard),
            ("send_private", Some(dictkey), Some(target)) => Ok(ReplyMode::Private {
                dictkey: dictkey.to_string(),
                target: target.to_string(),
            }),
            _ => Err(HandlerError::UnknownReply(name.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Server bug: the handler named a reply function that does not exist.
    #[error("unknown reply function {0:?}")]
    UnknownReply(String),
    #[error("{0} needs an authenticated request")]
    Unauthenticated(String),
    #[error("{0}")]
    Failed(String),
}

/// Application logic behind a request server.
///
/// `enc` is how the request arrived. A `Clear` request comes from a node
/// that never authenticated, so it can only read a `Clear` reply.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, enc: Enc, load: Load) -> Result<(Value, ReplyMode), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Decoded,
    Validated,
    Dispatched,
    Replied,
    Errored,
}

/// Result of processing one message.
#[derive(Debug)]
pub struct Processed {
    pub reply: Value,
    /// Ask the transport to drop the requester's connection.
    pub close: bool,
    pub state: MessageState,
}

impl Processed {
    fn replied(reply: Value) -> Self {
        Self {
            reply,
            close: false,
            state: MessageState::Replied,
        }
    }

    fn errored(reply: impl Into<String>) -> Self {
        Self {
            reply: Value::String(reply.into()),
            close: false,
            state: MessageState::Errored,
        }
    }
}

/// Reply frame for a transport to write back.
#[derive(Debug, Clone)]
pub struct ServerReply {
    pub frame: Bytes,
    pub close: bool,
}

pub struct ReqServerChannel {
    handler: Arc<dyn RequestHandler>,
    keys: Arc<KeyAuthority>,
}

impl ReqServerChannel {
    pub fn new(handler: Arc<dyn RequestHandler>, keys: Arc<KeyAuthority>) -> Self {
        Self { handler, keys }
    }

    pub fn keys(&self) -> &Arc<KeyAuthority> {
        &self.keys
    }

    /// Process one raw request frame and build the reply frame, echoing the
    /// request's correlation id.
    pub async fn handle_frame(&self, frame: &[u8]) -> ServerReply {
        let (head, processed) = match Envelope::decode(frame) {
            Ok(env) => {
                let processed = self.process_message(&env.head, env.body).await;
                (env.head, processed)
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable request frame");
                (Map::new(), Processed::errored(BAD_LOAD))
            }
        };

        let mut reply = Envelope::new(processed.reply);
        if let Some(mid) = head.get(HEAD_MID) {
            reply.head.insert(HEAD_MID.to_string(), mid.clone());
        }
        let frame = reply.encode().unwrap_or_else(|e| {
            tracing::error!(error = %e, "reply could not be framed");
            let mut fallback = Envelope::new(json!(SERVER_EXCEPTION));
            fallback.head = reply.head.clone();
            fallback.encode().unwrap_or_default()
        });
        ServerReply {
            frame,
            close: processed.close,
        }
    }

    /// Decode, validate and dispatch one request payload.
    pub async fn process_message(&self, head: &Map<String, Value>, payload: Value) -> Processed {
        let mid = head.get(HEAD_MID).and_then(Value::as_str).unwrap_or("-");
        tracing::trace!(mid, state = ?MessageState::Received, "request");

        let payload = match Payload::from_value(payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(mid, error = %e, "bad load");
                return Processed::errored(BAD_LOAD);
            }
        };

        let session = self.keys.session();
        let enc = payload.enc;
        let wants_nonce = payload.has_nonce();
        let load_value = match enc {
            Enc::Clear => payload.load,
            Enc::Aes => match payload.ciphertext().ok().and_then(|ct| session.loads(&ct, None).ok()) {
                Some(value) => value,
                None => {
                    tracing::debug!(mid, "request not readable with the current session key");
                    return Processed::errored(BAD_LOAD);
                }
            },
        };
        tracing::trace!(mid, state = ?MessageState::Decoded, enc = ?enc, "request");

        let mut load = match load_value {
            Value::Object(map) => map,
            _ => {
                tracing::warn!(mid, "load is not a mapping");
                return Processed::errored(NOT_A_DICT);
            }
        };
        let nonce = match (enc, wants_nonce) {
            (Enc::Aes, true) => match load.remove("nonce") {
                Some(Value::String(n)) => Some(n),
                _ => None,
            },
            _ => None,
        };

        match load.get("id") {
            Some(Value::String(id)) if id.contains('\0') => {
                tracing::warn!(mid, "id contains a null byte");
                return Processed::errored(ID_NULL_BYTE);
            }
            Some(Value::String(_)) | None => {}
            Some(other) => {
                tracing::warn!(mid, id = %other, "id is not a string");
                return Processed::errored(format!("bad load: id {other} is not a string"));
            }
        }
        tracing::trace!(mid, state = ?MessageState::Validated, "request");

        if enc == Enc::Clear && load.get("cmd").and_then(Value::as_str) == Some(AUTH_CMD) {
            return Processed::replied(self.keys.handle_auth(&load));
        }

        tracing::trace!(mid, state = ?MessageState::Dispatched, "request");
        let handler = self.handler.clone();
        let outcome = tokio::spawn(async move { handler.handle(enc, load).await }).await;

        match outcome {
            Ok(Ok((ret, mode))) => match self.encode_reply(ret, mode, &session, nonce.as_deref()) {
                Ok(reply) => Processed::replied(reply),
                Err(e) => {
                    tracing::error!(mid, error = %e, "failed to encode reply");
                    Processed::errored(SERVER_EXCEPTION)
                }
            },
            Ok(Err(HandlerError::UnknownReply(name))) => {
                tracing::error!(mid, reply_fn = %name, "unknown reply function");
                Processed {
                    close: true,
                    ..Processed::errored(SERVER_EXCEPTION)
                }
            }
            Ok(Err(e @ HandlerError::Unauthenticated(_))) => {
                tracing::warn!(mid, error = %e, "refused clear request");
                Processed::errored(HANDLER_EXCEPTION)
            }
            Ok(Err(e)) => {
                tracing::error!(mid, error = %e, "handler failed");
                Processed::errored(HANDLER_EXCEPTION)
            }
            Err(e) => {
                tracing::error!(mid, error = %e, "handler panicked");
                Processed::errored(HANDLER_EXCEPTION)
            }
        }
    }

    fn encode_reply(
        &self,
        ret: Value,
        mode: ReplyMode,
        session: &Crypticle,
        nonce: Option<&str>,
    ) -> Result<Value, crate::error::AuthError> {
        match mode {
            ReplyMode::Clear => Ok(ret),
            ReplyMode::Standard => {
                let ciphertext = session.dumps(&ret, nonce)?;
                Ok(Payload::aes(&ciphertext).to_value())
            }
            ReplyMode::Private { dictkey, target } => {
                let (sealed_key, ciphertext) = self.keys.seal_private(&target, &ret, nonce)?;
                let mut reply = Map::new();
                reply.insert("key".to_string(), Value::String(B64.encode(sealed_key)));
                reply.insert(dictkey, Value::String(B64.encode(ciphertext)));
                Ok(Value::Object(reply))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saltline_core::config::AuthConfig;
    use saltline_core::crypto::{request_nonce, Keypair};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    struct Recorder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for Recorder {
        async fn handle(&self, enc: Enc, load: Load) -> Result<(Value, ReplyMode), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match load.get("cmd").and_then(Value::as_str) {
                Some("which") => Ok((json!(enc == Enc::Aes), ReplyMode::Clear)),
                Some("boom") => Err(HandlerError::Failed("exploded".into())),
                Some("panic") => panic!("handler panic"),
                Some("weird") => Ok((json!(1), ReplyMode::from_name("send_sideways", None, None)?)),
                Some("enc") => Ok((json!({"ok": true}), ReplyMode::Standard)),
                _ => Ok((json!({"echo": Value::Object(load)}), ReplyMode::Clear)),
            }
        }
    }

    fn server() -> (ReqServerChannel, Arc<Recorder>, std::path::PathBuf) {
        let n = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("saltline-server-test-{}-{n}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let keys = Arc::new(
            KeyAuthority::new(&dir, AuthConfig { auto_accept: true, ..Default::default() }, false).unwrap(),
        );
        let handler = Arc::new(Recorder {
            calls: AtomicUsize::new(0),
        });
        (ReqServerChannel::new(handler.clone(), keys), handler, dir)
    }

    fn clear(load: Value) -> Value {
        json!({"enc": "clear", "load": load})
    }

    #[tokio::test]
    async fn malformed_payloads_get_literal_replies() {
        let (srv, handler, dir) = server();
        let head = Map::new();

        let r = srv.process_message(&head, json!({"enc": "clear"})).await;
        assert_eq!(r.reply, json!(BAD_LOAD));
        assert_eq!(r.state, MessageState::Errored);

        let r = srv.process_message(&head, json!("not a payload")).await;
        assert_eq!(r.reply, json!(BAD_LOAD));

        let r = srv.process_message(&head, clear(json!([1, 2]))).await;
        assert_eq!(r.reply, json!(NOT_A_DICT));

        let r = srv.process_message(&head, clear(json!({"id": "a\u{0}b"}))).await;
        assert_eq!(r.reply, json!(ID_NULL_BYTE));

        let r = srv.process_message(&head, clear(json!({"id": 12}))).await;
        assert_eq!(r.reply, json!("bad load: id 12 is not a string"));

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        // and the channel still serves a good message afterwards
        let r = srv.process_message(&head, clear(json!({"cmd": "hi", "id": "m1"}))).await;
        assert_eq!(r.state, MessageState::Replied);
        assert_eq!(r.reply["echo"]["cmd"], "hi");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn undecryptable_aes_load_is_bad_load() {
        let (srv, _, dir) = server();
        let stranger = Crypticle::generate();
        let ct = stranger.dumps(&json!({"cmd": "x"}), None).unwrap();
        let r = srv.process_message(&Map::new(), Payload::aes(&ct).to_value()).await;
        assert_eq!(r.reply, json!(BAD_LOAD));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn clear_auth_never_reaches_handler() {
        let (srv, handler, dir) = server();
        let minion = Keypair::generate();
        let r = srv
            .process_message(
                &Map::new(),
                clear(json!({"cmd": "_auth", "id": "m1", "pub": minion.public_hex()})),
            )
            .await;
        assert_eq!(r.reply["ret"], true);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn standard_reply_is_encrypted_with_request_nonce() {
        let (srv, _, dir) = server();
        let session = srv.keys().session();
        let nonce = request_nonce();
        let ct = session
            .dumps(&json!({"cmd": "enc", "nonce": nonce}), None)
            .unwrap();
        let r = srv.process_message(&Map::new(), Payload::aes(&ct).to_value()).await;
        let reply = Payload::from_value(r.reply).unwrap();
        assert_eq!(reply.enc, Enc::Aes);
        let opened = session.loads(&reply.ciphertext().unwrap(), Some(&nonce)).unwrap();
        assert_eq!(opened, json!({"ok": true}));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn handler_sees_how_the_request_arrived() {
        let (srv, _, dir) = server();
        let r = srv.process_message(&Map::new(), clear(json!({"cmd": "which"}))).await;
        assert_eq!(r.reply, json!(false));

        let ct = srv.keys().session().dumps(&json!({"cmd": "which"}), None).unwrap();
        let r = srv.process_message(&Map::new(), Payload::aes(&ct).to_value()).await;
        assert_eq!(r.reply, json!(true));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn handler_failures_map_to_generic_replies() {
        let (srv, _, dir) = server();
        let r = srv.process_message(&Map::new(), clear(json!({"cmd": "boom"}))).await;
        assert_eq!(r.reply, json!(HANDLER_EXCEPTION));
        assert!(!r.close);

        let r = srv.process_message(&Map::new(), clear(json!({"cmd": "panic"}))).await;
        assert_eq!(r.reply, json!(HANDLER_EXCEPTION));

        let r = srv.process_message(&Map::new(), clear(json!({"cmd": "weird"}))).await;
        assert_eq!(r.reply, json!(SERVER_EXCEPTION));
        assert!(r.close);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn frame_reply_echoes_correlation_id() {
        let (srv, _, dir) = server();
        let frame = Envelope::new(clear(json!({"cmd": "hi"})))
            .with_head(HEAD_MID, "abc")
            .encode()
            .unwrap();
        let reply = srv.handle_frame(&frame).await;
        let env = Envelope::decode(&reply.frame).unwrap();
        assert_eq!(env.mid(), Some("abc"));
        assert_eq!(env.body["echo"]["cmd"], "hi");

        let reply = srv.handle_frame(b"garbage").await;
        assert_eq!(Envelope::decode(&reply.frame).unwrap().body, json!(BAD_LOAD));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reply_modes_resolve_by_name() {
        assert_eq!(ReplyMode::from_name("send", None, None).unwrap(), ReplyMode::Standard);
        assert_eq!(ReplyMode::from_name("send_clear", None, None).unwrap(), ReplyMode::Clear);
        assert!(matches!(
            ReplyMode::from_name("send_private", Some("pillar"), Some("m1")).unwrap(),
            ReplyMode::Private { .. }
        ));
        assert!(ReplyMode::from_name("send_private", None, None).is_err());
        assert!(ReplyMode::from_name("nope", None, None).is_err());
    }

    #[test]
    fn error_literals_are_recognised() {
        assert!(is_error_reply(BAD_LOAD));
        assert!(is_error_reply("bad load: id 7 is not a string"));
        assert!(is_error_reply(HANDLER_EXCEPTION));
        assert!(!is_error_reply("pong"));
    }
}
