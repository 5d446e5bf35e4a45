//! Publish client channel.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;

use saltline_core::config::Crypt;
use saltline_core::crypto::{self, ReplayWindow};
use saltline_core::payload::{Enc, Load, Payload};
use saltline_core::wire::Envelope;

use crate::error::{AuthError, ChannelError};
use crate::req_client::AsyncReqChannel;
use crate::transport::PubClientTransport;

/// Invoked once per decoded publish.
pub type PubCallback = Arc<dyn Fn(Load) + Send + Sync>;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Backoff for the initial connect.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
        }
    }
}

struct PubInner {
    req: Arc<AsyncReqChannel>,
    transport: Arc<dyn PubClientTransport>,
    node_id: String,
    callback: RwLock<Option<PubCallback>>,
    replay: Mutex<ReplayWindow>,
}

pub struct AsyncPubChannel {
    inner: Arc<PubInner>,
    retry: ConnectRetry,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncPubChannel {
    /// `req` is the request channel used to authenticate; it is normally
    /// obtained from the same registry as the caller's own request channel.
    pub fn new(req: Arc<AsyncReqChannel>, transport: Arc<dyn PubClientTransport>) -> Self {
        let node_id = req.options().node_id.clone();
        Self {
            inner: Arc::new(PubInner {
                req,
                transport,
                node_id,
                callback: RwLock::new(None),
                replay: Mutex::new(ReplayWindow::new()),
            }),
            retry: ConnectRetry::default(),
            task: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: ConnectRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Authenticate, open the transport and start receiving.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let mut delay = self.retry.initial;
        let mut attempt = 1;
        loop {
            match self.inner.connect_once().await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    tracing::warn!(attempt, error = %e, retry_in = ?delay, "publish channel connect failed");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ChannelError::Client(format!(
                        "unable to connect publish channel after {attempt} attempts: {e}"
                    )))
                }
            }
        }

        let mut task = self.task.lock();
        if task.as_ref().map_or(true, JoinHandle::is_finished) {
            *task = Some(tokio::spawn(self.inner.clone().recv_loop()));
        }
        tracing::info!(node = %self.inner.node_id, "publish channel connected");
        Ok(())
    }

    /// Register (or with `None`, clear) the message callback.
    pub fn on_recv(&self, callback: Option<PubCallback>) {
        *self.inner.callback.write() = callback;
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub async fn close(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.transport.close().await;
    }
}

impl Drop for AsyncPubChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl PubInner {
    async fn connect_once(&self) -> Result<(), ChannelError> {
        if self.req.options().crypt == Crypt::Aes {
            self.req.authenticate().await?;
        }
        self.transport.connect(&self.node_id).await?;
        Ok(())
    }

    async fn recv_loop(self: Arc<Self>) {
        loop {
            let frame = match self.transport.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!("publish stream closed");
                    return;
                }
                Err(e) if e.is_disconnect() => {
                    tracing::warn!(error = %e, "publish stream lost, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    if let Err(e) = self.transport.connect(&self.node_id).await {
                        tracing::warn!(error = %e, "publish reconnect failed");
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "publish transport failed");
                    return;
                }
            };

            match self.decode(&frame).await {
                Ok(Some(load)) => {
                    let callback = self.callback.read().clone();
                    if let Some(callback) = callback {
                        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(load))).is_err() {
                            tracing::error!("publish callback panicked");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "dropping undecodable publish"),
            }
        }
    }

    /// `Ok(None)` for publishes that are not for us or were already seen.
    async fn decode(&self, frame: &Bytes) -> Result<Option<Load>, ChannelError> {
        let envelope = Envelope::decode(frame)?;
        if let Some(topics) = envelope.topics() {
            if !topics.contains(&self.node_id.as_str()) {
                return Ok(None);
            }
        }

        let payload = Payload::from_value(envelope.body)?;
        let value = match payload.enc {
            Enc::Clear => payload.load,
            Enc::Aes => self.decrypt(&payload).await?,
        };
        let Value::Object(load) = value else {
            return Err(ChannelError::BadReply("publish load is not a mapping".into()));
        };

        if let Some(serial) = load.get("serial").and_then(Value::as_u64) {
            if !self.replay.lock().accept(serial) {
                tracing::debug!(serial, "replayed publish dropped");
                return Ok(None);
            }
        }
        Ok(Some(load))
    }

    async fn decrypt(&self, payload: &Payload) -> Result<Value, ChannelError> {
        let session = match self.req.session().await {
            Some(session) => session,
            None => self.req.authenticate().await?,
        };
        let ciphertext = payload.ciphertext()?;

        if let Some(sign_pub) = &session.sign_pub {
            let sig = payload
                .signature()?
                .ok_or_else(|| ChannelError::BadReply("publish is not signed".into()))?;
            crypto::verify(sign_pub, &ciphertext, &sig).map_err(AuthError::Crypto)?;
        }

        match session.crypticle.loads(&ciphertext, None) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::info!(error = %e, "publish unreadable with current session, re-authenticating");
                let session = self.req.reauth(Some(&session)).await?;
                Ok(session
                    .crypticle
                    .loads(&ciphertext, None)
                    .map_err(AuthError::Decrypt)?)
            }
        }
    }
}
