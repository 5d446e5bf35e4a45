//! Correlated request/reply over a `ReqClientTransport`.
//!
//! Every outbound frame is tagged with a correlation id derived from its
//! bytes. A single reader task resolves pending requests as replies arrive,
//! in any order. A request whose reply does not arrive within `timeout` is
//! resent under the same id until `tries` attempts have been made.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use saltline_core::wire::{Envelope, HEAD_MID};

use crate::error::{ChannelError, TransportError};
use crate::transport::{ReplyEvent, ReqClientTransport};

type ReplySender = oneshot::Sender<Result<Bytes, TransportError>>;

/// One in-flight request.
pub struct PendingRequest {
    reply: ReplySender,
    pub attempts: u32,
    pub tries: u32,
    pub timeout: Duration,
}

/// Correlation id → in-flight request.
pub type PendingMap = Arc<DashMap<String, PendingRequest>>;

/// Hex of the first 16 bytes of BLAKE3 over the request bytes, optionally
/// salted to break collisions between identical in-flight requests.
pub fn correlation_id(body: &[u8], salt: Option<u64>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(body);
    if let Some(salt) = salt {
        hasher.update(&salt.to_le_bytes());
    }
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// The caller's half of one pending request. Dropping it, on any exit from
/// `send` including cancellation, removes the pending entry.
struct InFlight<'a> {
    pending: &'a PendingMap,
    id: String,
    rx: oneshot::Receiver<Result<Bytes, TransportError>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.rx.close();
        // a later request may have reused the id; its sender is still open
        self.pending.remove_if(&self.id, |_, p| p.reply.is_closed());
    }
}

pub struct MessageClient {
    transport: Arc<dyn ReqClientTransport>,
    pending: PendingMap,
    salt: AtomicU64,
    connected: tokio::sync::Mutex<bool>,
    lost: Arc<AtomicBool>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MessageClient {
    pub fn new(transport: Arc<dyn ReqClientTransport>) -> Self {
        Self {
            transport,
            pending: Arc::new(DashMap::new()),
            salt: AtomicU64::new(0),
            connected: tokio::sync::Mutex::new(false),
            lost: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connect the transport and start the reply reader. Reconnects if the
    /// previous reader saw the connection drop.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut connected = self.connected.lock().await;
        if *connected && !self.lost.load(Ordering::Acquire) {
            return Ok(());
        }
        if *connected {
            tracing::info!("reconnecting request transport");
        }
        self.transport.connect().await?;
        self.lost.store(false, Ordering::Release);
        let handle = tokio::spawn(read_replies(
            self.transport.clone(),
            self.pending.clone(),
            self.lost.clone(),
        ));
        if let Some(old) = self.reader.lock().replace(handle) {
            old.abort();
        }
        *connected = true;
        Ok(())
    }

    /// Send `body` and wait for the correlated reply envelope.
    pub async fn send(&self, body: &Value, tries: u32, timeout: Duration) -> Result<Envelope, ChannelError> {
        self.connect().await?;

        let bytes = serde_json::to_vec(body).map_err(|e| ChannelError::Client(e.to_string()))?;
        let tries = tries.max(1);
        let (tx, rx) = oneshot::channel();
        let id = self.register(
            &bytes,
            PendingRequest {
                reply: tx,
                attempts: 0,
                tries,
                timeout,
            },
        );
        let mut in_flight = InFlight {
            pending: &self.pending,
            id,
            rx,
        };
        let id = in_flight.id.clone();
        let frame = Envelope::new(body.clone())
            .with_head(HEAD_MID, id.clone())
            .encode()
            .map_err(|e| ChannelError::Client(e.to_string()))?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            if let Some(mut p) = self.pending.get_mut(&id) {
                p.attempts = attempts;
            }
            if attempts > 1 {
                tracing::debug!(correlation_id = %id, attempt = attempts, tries, "resending request");
            }
            self.transport.publish_bytes(&id, frame.clone()).await?;

            match tokio::time::timeout(timeout, &mut in_flight.rx).await {
                Ok(Ok(Ok(reply))) => return Ok(Envelope::decode(&reply)?),
                Ok(Ok(Err(e))) => return Err(e.into()),
                Ok(Err(_)) => return Err(ChannelError::ConnectionLost),
                Err(_) if attempts >= tries => {
                    tracing::warn!(correlation_id = %id, tries, "request timed out");
                    return Err(ChannelError::Timeout { tries });
                }
                Err(_) => {}
            }
        }
    }

    fn register(&self, body: &[u8], request: PendingRequest) -> String {
        let mut id = correlation_id(body, None);
        loop {
            match self.pending.entry(id) {
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    slot.insert(request);
                    return id;
                }
                Entry::Occupied(_) => {
                    let salt = self.salt.fetch_add(1, Ordering::Relaxed);
                    id = correlation_id(body, Some(salt));
                }
            }
        }
    }

    /// Stop the reader, fail every pending request and close the transport.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        fail_all(&self.pending);
        let transport = self.transport.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { transport.close().await });
        }
    }
}

impl Drop for MessageClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_replies(transport: Arc<dyn ReqClientTransport>, pending: PendingMap, lost: Arc<AtomicBool>) {
    loop {
        match transport.recv_reply().await {
            Ok(Some(ReplyEvent::Reply {
                correlation_id,
                frame,
            })) => match pending.remove(&correlation_id) {
                Some((_, request)) => {
                    let _ = request.reply.send(Ok(frame));
                }
                None => {
                    tracing::debug!(%correlation_id, "reply for unknown or expired request");
                }
            },
            Ok(Some(ReplyEvent::Failed {
                correlation_id,
                error,
            })) => {
                if let Some((_, request)) = pending.remove(&correlation_id) {
                    let _ = request.reply.send(Err(error));
                }
            }
            Ok(None) => {
                tracing::debug!("reply stream closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "reply stream failed");
                break;
            }
        }
    }
    lost.store(true, Ordering::Release);
    fail_all(&pending);
}

fn fail_all(pending: &PendingMap) {
    let ids: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        if let Some((_, request)) = pending.remove(&id) {
            let _ = request.reply.send(Err(TransportError::Closed));
        }
    }
}
