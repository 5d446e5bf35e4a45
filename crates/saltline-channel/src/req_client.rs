//! Request channel and the registry that shares it.
//!
//! A `ChannelRegistry` holds at most one live channel per `ChannelKey`
//! (pki dir, node id, master uri, crypt). `obtain` hands out a new handle to
//! the existing channel or builds one; the channel is torn down when the last
//! handle is closed or dropped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use serde_json::Value;

use saltline_core::config::{Crypt, SaltlineConfig, TransportKind};
use saltline_core::crypto;
use saltline_core::payload::{Enc, Load, Payload};

use crate::auth::{AsyncAuth, AuthSession};
use crate::error::{AuthError, ChannelError, TransportError};
use crate::message_client::MessageClient;
use crate::req_server::{is_error_reply, BAD_LOAD};
use crate::transport::{ReqClientTransport, TransportFactory};

// ── Options & identity ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub node_id: String,
    pub pki_dir: PathBuf,
    pub master_uri: String,
    pub publish_uri: String,
    pub crypt: Crypt,
    pub transport: TransportKind,
    pub tries: u32,
    pub timeout: Duration,
}

impl ChannelOptions {
    pub fn from_config(config: &SaltlineConfig) -> Self {
        Self {
            node_id: config.identity.node_id.clone(),
            pki_dir: config.identity.pki_dir.clone(),
            master_uri: config.master.req_uri.clone(),
            publish_uri: config.master.publish_uri.clone(),
            crypt: config.channel.crypt,
            transport: config.channel.transport,
            tries: config.channel.tries,
            timeout: config.channel.timeout(),
        }
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey {
            pki_dir: self.pki_dir.clone(),
            node_id: self.node_id.clone(),
            master_uri: self.master_uri.clone(),
            crypt: self.crypt,
        }
    }
}

/// Identity of a request channel. Equal keys share one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub pki_dir: PathBuf,
    pub node_id: String,
    pub master_uri: String,
    pub crypt: Crypt,
}

// ── Registry ──────────────────────────────────────────────────────────────────

type Slot = (Arc<ReqChannelInner>, usize);

pub struct ChannelRegistry {
    factory: Arc<dyn TransportFactory>,
    channels: ReentrantMutex<RefCell<HashMap<ChannelKey, Slot>>>,
}

impl ChannelRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            channels: ReentrantMutex::new(RefCell::new(HashMap::new())),
        })
    }

    pub fn factory(&self) -> &Arc<dyn TransportFactory> {
        &self.factory
    }

    /// Handle to the channel for `opts`, creating it with the registry's
    /// transport factory if none is live.
    pub fn obtain(self: &Arc<Self>, opts: &ChannelOptions) -> Result<AsyncReqChannel, ChannelError> {
        let factory = self.factory.clone();
        self.obtain_with(opts, |o| factory.req_client(o))
    }

    /// Like `obtain`, with an explicit transport constructor. The constructor
    /// only runs when no channel for the key exists.
    pub fn obtain_with<F>(self: &Arc<Self>, opts: &ChannelOptions, make: F) -> Result<AsyncReqChannel, ChannelError>
    where
        F: FnOnce(&ChannelOptions) -> Result<Arc<dyn ReqClientTransport>, TransportError>,
    {
        let key = opts.key();
        let guard = self.channels.lock();
        let mut map = guard.borrow_mut();

        if let Some((inner, count)) = map.get_mut(&key) {
            *count += 1;
            tracing::trace!(node = %key.node_id, master = %key.master_uri, refs = *count, "reusing request channel");
            return Ok(AsyncReqChannel::new(inner.clone(), self.clone(), key));
        }

        let auth = match opts.crypt {
            Crypt::Clear => None,
            Crypt::Aes => Some(AsyncAuth::new(&opts.node_id, &opts.pki_dir)?),
        };
        let transport = make(opts).map_err(ChannelError::Transport)?;
        let inner = Arc::new(ReqChannelInner {
            opts: opts.clone(),
            client: MessageClient::new(transport),
            auth,
            session: tokio::sync::RwLock::new(None),
            auth_lock: tokio::sync::Mutex::new(()),
        });
        map.insert(key.clone(), (inner.clone(), 1));
        tracing::debug!(node = %key.node_id, master = %key.master_uri, crypt = ?key.crypt, "request channel created");
        Ok(AsyncReqChannel::new(inner, self.clone(), key))
    }

    pub fn ref_count(&self, key: &ChannelKey) -> usize {
        let guard = self.channels.lock();
        let count = guard.borrow().get(key).map(|(_, n)| *n).unwrap_or(0);
        count
    }

    pub fn len(&self) -> usize {
        let guard = self.channels.lock();
        let len = guard.borrow().len();
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &ChannelKey) {
        let guard = self.channels.lock();
        let removed = {
            let mut map = guard.borrow_mut();
            match map.get_mut(key) {
                Some((_, count)) if *count > 1 => {
                    *count -= 1;
                    None
                }
                Some(_) => map.remove(key).map(|(inner, _)| inner),
                None => None,
            }
        };
        drop(guard);
        if let Some(inner) = removed {
            tracing::debug!(node = %key.node_id, master = %key.master_uri, "last handle released, closing channel");
            inner.client.close();
        }
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

struct ReqChannelInner {
    opts: ChannelOptions,
    client: MessageClient,
    auth: Option<AsyncAuth>,
    session: tokio::sync::RwLock<Option<Arc<AuthSession>>>,
    auth_lock: tokio::sync::Mutex<()>,
}

/// Handle to a shared request channel.
pub struct AsyncReqChannel {
    inner: Arc<ReqChannelInner>,
    registry: Arc<ChannelRegistry>,
    key: ChannelKey,
    released: AtomicBool,
}

impl AsyncReqChannel {
    fn new(inner: Arc<ReqChannelInner>, registry: Arc<ChannelRegistry>, key: ChannelKey) -> Self {
        Self {
            inner,
            registry,
            key,
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.opts
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Whether two handles share the same underlying channel.
    pub fn same_channel(&self, other: &AsyncReqChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn auth(&self) -> Option<&AsyncAuth> {
        self.inner.auth.as_ref()
    }

    pub async fn session(&self) -> Option<Arc<AuthSession>> {
        self.inner.session.read().await.clone()
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        if self.released.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.check_open()?;
        self.inner.client.connect().await
    }

    /// Current auth session, authenticating first if there is none.
    pub async fn authenticate(&self) -> Result<Arc<AuthSession>, ChannelError> {
        self.check_open()?;
        self.reauth(None).await
    }

    /// Authenticate unless another task already replaced `failed`.
    pub async fn reauth(&self, failed: Option<&Arc<AuthSession>>) -> Result<Arc<AuthSession>, ChannelError> {
        let auth = self.inner.auth.as_ref().ok_or(AuthError::NoAuth)?;
        let _guard = self.inner.auth_lock.lock().await;

        if let Some(current) = self.inner.session.read().await.clone() {
            let stale = failed.is_some_and(|f| Arc::ptr_eq(f, &current));
            if !stale {
                return Ok(current);
            }
        }

        let request = Payload::clear(auth.auth_request()).to_value();
        let reply = self
            .inner
            .client
            .send(&request, self.inner.opts.tries, self.inner.opts.timeout)
            .await?;
        let session = Arc::new(auth.complete(&reply.body)?);
        *self.inner.session.write().await = Some(session.clone());
        tracing::debug!(node = %self.key.node_id, "auth session established");
        Ok(session)
    }

    /// Send with the configured tries and timeout.
    pub async fn send(&self, load: Load) -> Result<Option<Value>, ChannelError> {
        self.send_with(load, self.inner.opts.tries, self.inner.opts.timeout)
            .await
    }

    /// Send a load and return the decrypted reply. `None` for an empty reply.
    ///
    /// Authenticates first on an `aes` channel. If the master can no longer
    /// read our requests (or we cannot read its reply) the channel
    /// re-authenticates once and retries once.
    pub async fn send_with(&self, load: Load, tries: u32, timeout: Duration) -> Result<Option<Value>, ChannelError> {
        self.check_open()?;
        if self.inner.opts.crypt == Crypt::Clear {
            return self.send_clear_with(load, tries, timeout).await;
        }

        let session = self.reauth(None).await?;
        match self.crypted_transfer(&load, &session, tries, timeout).await {
            Err(e) if e.is_auth_failure() => {
                tracing::info!(error = %e, "session no longer valid, re-authenticating");
                let session = self.reauth(Some(&session)).await?;
                self.crypted_transfer(&load, &session, tries, timeout).await
            }
            other => other,
        }
    }

    pub async fn send_clear(&self, load: Load) -> Result<Option<Value>, ChannelError> {
        self.send_clear_with(load, self.inner.opts.tries, self.inner.opts.timeout)
            .await
    }

    /// Unauthenticated, unencrypted request.
    pub async fn send_clear_with(&self, load: Load, tries: u32, timeout: Duration) -> Result<Option<Value>, ChannelError> {
        self.check_open()?;
        let reply = self
            .inner
            .client
            .send(&Payload::clear(load).to_value(), tries, timeout)
            .await?;
        match reply.body {
            Value::Null => Ok(None),
            Value::String(s) if is_error_reply(&s) => Err(ChannelError::Server(s)),
            other => Ok(Some(other)),
        }
    }

    /// Send an encrypted request whose reply was encrypted for this node
    /// alone, and return the decrypted `dictkey` entry.
    pub async fn crypted_transfer_decode_dictentry(&self, load: Load, dictkey: &str) -> Result<Value, ChannelError> {
        self.check_open()?;
        let session = self.reauth(None).await?;
        match self.private_transfer(&load, dictkey, &session).await {
            Err(e) if e.is_auth_failure() => {
                tracing::info!(error = %e, "private reply unreadable, re-authenticating");
                let session = self.reauth(Some(&session)).await?;
                self.private_transfer(&load, dictkey, &session).await
            }
            other => other,
        }
    }

    async fn send_encrypted(
        &self,
        load: &Load,
        session: &AuthSession,
        nonce: &str,
        tries: u32,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let mut load = load.clone();
        load.insert("nonce".to_string(), Value::String(nonce.to_string()));
        let ciphertext = session
            .crypticle
            .dumps(&Value::Object(load), None)
            .map_err(AuthError::Crypto)?;
        let reply = self
            .inner
            .client
            .send(&Payload::aes(&ciphertext).to_value(), tries, timeout)
            .await?;
        Ok(reply.body)
    }

    async fn crypted_transfer(
        &self,
        load: &Load,
        session: &AuthSession,
        tries: u32,
        timeout: Duration,
    ) -> Result<Option<Value>, ChannelError> {
        let nonce = crypto::request_nonce();
        let body = self.send_encrypted(load, session, &nonce, tries, timeout).await?;
        decode_reply(body, session, &nonce)
    }

    async fn private_transfer(&self, load: &Load, dictkey: &str, session: &AuthSession) -> Result<Value, ChannelError> {
        let auth = self.inner.auth.as_ref().ok_or(AuthError::NoAuth)?;
        let nonce = crypto::request_nonce();
        let body = self
            .send_encrypted(load, session, &nonce, self.inner.opts.tries, self.inner.opts.timeout)
            .await?;
        match &body {
            Value::String(s) if s == BAD_LOAD => Err(AuthError::BadLoad.into()),
            Value::String(s) => Err(ChannelError::Server(s.clone())),
            Value::Object(_) => Ok(auth.open_private(session, &body, dictkey, Some(&nonce))?),
            other => Err(ChannelError::BadReply(format!("unexpected private reply {other}"))),
        }
    }

    /// Release this handle. The channel closes when the last handle goes.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.release(&self.key);
    }
}

impl Drop for AsyncReqChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_reply(body: Value, session: &AuthSession, nonce: &str) -> Result<Option<Value>, ChannelError> {
    match body {
        Value::Null => Ok(None),
        Value::String(s) if s == BAD_LOAD => Err(AuthError::BadLoad.into()),
        Value::String(s) if is_error_reply(&s) => Err(ChannelError::Server(s)),
        Value::Object(map) if map.contains_key("enc") => {
            let payload = Payload::from_value(Value::Object(map))?;
            if payload.enc != Enc::Aes {
                return Err(ChannelError::BadReply("clear payload on an encrypted channel".into()));
            }
            let ciphertext = payload.ciphertext()?;
            match session
                .crypticle
                .loads(&ciphertext, Some(nonce))
                .map_err(AuthError::Decrypt)?
            {
                Value::Null => Ok(None),
                value => Ok(Some(value)),
            }
        }
        other => Ok(Some(other)),
    }
}
