//! Framed TCP transport.
//!
//! Every message is one wire frame. Request frames carry `mid` in their head
//! and the reply echoes it, so many requests can share one connection.
//! Publish subscribers open a second connection and announce their node id
//! in a hello frame; the server uses it to filter topic-routed publishes.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};

use saltline_channel::error::TransportError;
use saltline_channel::req_server::ReqServerChannel;
use saltline_channel::transport::{
    PubClientTransport, PubServerTransport, ReplyEvent, ReqClientTransport, ReqServerTransport,
};
use saltline_core::wire::{Envelope, FrameHeader, HEADER_LEN, HEAD_ID};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Frames buffered for one subscriber; a slower subscriber misses publishes.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

// ── Framing ───────────────────────────────────────────────────────────────────

/// Read one complete frame, header included. `Ok(None)` on a clean EOF
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = FrameHeader::parse(&header)?;
    let mut frame = BytesMut::zeroed(HEADER_LEN + len);
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(Some(frame.freeze()))
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn dial(addr: &str) -> Result<(OwnedReadHalf, OwnedWriteHalf), TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    Ok(stream.into_split())
}

// ── Request client ────────────────────────────────────────────────────────────

pub struct TcpReqClient {
    addr: String,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
}

impl TcpReqClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ReqClientTransport for TcpReqClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (reader, writer) = dial(&self.addr).await?;
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        tracing::debug!(addr = %self.addr, "request connection open");
        Ok(())
    }

    async fn publish_bytes(&self, _correlation_id: &str, frame: Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = write_frame(w, &frame).await {
            *writer = None;
            return Err(e);
        }
        Ok(())
    }

    async fn recv_reply(&self) -> Result<Option<ReplyEvent>, TransportError> {
        let mut reader = self.reader.lock().await;
        let Some(r) = reader.as_mut() else {
            return if self.closed.load(Ordering::Acquire) {
                Ok(None)
            } else {
                Err(TransportError::NotConnected)
            };
        };
        loop {
            let Some(frame) = read_frame(r).await? else {
                *reader = None;
                return if self.closed.load(Ordering::Acquire) {
                    Ok(None)
                } else {
                    Err(TransportError::Closed)
                };
            };
            match Envelope::decode(&frame).map(|env| env.mid().map(str::to_string)) {
                Ok(Some(correlation_id)) => {
                    return Ok(Some(ReplyEvent::Reply {
                        correlation_id,
                        frame,
                    }))
                }
                Ok(None) => tracing::warn!("reply frame without correlation id"),
                Err(e) => tracing::warn!(error = %e, "undecodable reply frame"),
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

// ── Request server ────────────────────────────────────────────────────────────

pub struct TcpReqServer {
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl TcpReqServer {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "request server listening");
        Ok(Self {
            listener: parking_lot::Mutex::new(Some(listener)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl ReqServerTransport for TcpReqServer {
    async fn serve(
        self: Arc<Self>,
        channel: Arc<ReqServerChannel>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| TransportError::Config("request server is already serving".into()))?;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("request server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(stream, peer, channel.clone(), shutdown.resubscribe()));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    channel: Arc<ReqServerChannel>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let closing = Arc::new(tokio::sync::Notify::new());
    tracing::debug!(%peer, "request connection accepted");

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            _ = closing.notified() => break,
            read = read_frame(&mut reader) => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "request connection failed");
                    break;
                }
            },
        };

        let channel = channel.clone();
        let writer = writer.clone();
        let closing = closing.clone();
        tokio::spawn(async move {
            let reply = channel.handle_frame(&frame).await;
            let mut w = writer.lock().await;
            if let Err(e) = write_frame(&mut *w, &reply.frame).await {
                tracing::debug!(%peer, error = %e, "reply write failed");
            }
            if reply.close {
                tracing::warn!(%peer, "closing requester connection");
                let _ = w.shutdown().await;
                closing.notify_one();
            }
        });
    }
    tracing::debug!(%peer, "request connection closed");
}

// ── Publish server ────────────────────────────────────────────────────────────

struct Subscriber {
    node_id: String,
    tx: mpsc::Sender<Bytes>,
}

pub struct TcpPubServer {
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl TcpPubServer {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "publish server listening");
        Ok(Self {
            listener: parking_lot::Mutex::new(Some(listener)),
            local_addr,
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Accept subscribers until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| TransportError::Config("publish server is already running".into()))?;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("publish server shutting down");
                    self.subscribers.clear();
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(handle_subscriber(stream, peer, id, self.subscribers.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    subscribers: Arc<DashMap<u64, Subscriber>>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(Some(frame))) => Envelope::decode(&frame).ok(),
        _ => None,
    };
    let Some(node_id) = hello.and_then(|env| env.head.get(HEAD_ID).and_then(Value::as_str).map(str::to_string))
    else {
        tracing::warn!(%peer, "subscriber sent no hello, dropping");
        return;
    };

    let (tx, mut rx) = mpsc::channel::<Bytes>(SUBSCRIBER_QUEUE_DEPTH);
    subscribers.insert(id, Subscriber { node_id: node_id.clone(), tx });
    tracing::info!(%peer, node = %node_id, "subscriber connected");

    let mut sink = [0u8; 64];
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        tracing::debug!(node = %node_id, error = %e, "publish write failed");
                        break;
                    }
                }
                None => break,
            },
            // subscribers never send after hello; a read returning means EOF
            read = reader.read(&mut sink) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    subscribers.remove(&id);
    tracing::info!(node = %node_id, "subscriber disconnected");
}

#[async_trait]
impl PubServerTransport for TcpPubServer {
    async fn publish_string(&self, message: String, topics: Option<&[String]>) -> Result<(), TransportError> {
        let frame = B64
            .decode(message.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.publish_bytes(Bytes::from(frame), topics).await
    }

    async fn publish_bytes(&self, frame: Bytes, topics: Option<&[String]>) -> Result<(), TransportError> {
        let mut delivered = 0;
        for sub in self.subscribers.iter() {
            if let Some(topics) = topics {
                if !topics.iter().any(|t| t == &sub.node_id) {
                    continue;
                }
            }
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(node = %sub.node_id, "subscriber queue full, publish dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        tracing::trace!(delivered, "publish fanned out");
        Ok(())
    }

    fn topic_support(&self) -> bool {
        true
    }
}

// ── Publish client ────────────────────────────────────────────────────────────

pub struct TcpPubClient {
    addr: String,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
}

impl TcpPubClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PubClientTransport for TcpPubClient {
    async fn connect(&self, node_id: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (reader, mut writer) = dial(&self.addr).await?;
        let hello = Envelope::new(Value::Null).with_head(HEAD_ID, node_id).encode()?;
        write_frame(&mut writer, &hello).await?;
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        tracing::debug!(addr = %self.addr, node = node_id, "subscribed");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;
        let Some(r) = reader.as_mut() else {
            return if self.closed.load(Ordering::Acquire) {
                Ok(None)
            } else {
                Err(TransportError::NotConnected)
            };
        };
        match read_frame(r).await? {
            Some(frame) => Ok(Some(frame)),
            None => {
                *reader = None;
                if self.closed.load(Ordering::Acquire) {
                    Ok(None)
                } else {
                    Err(TransportError::Closed)
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
