//! HTTP transport.
//!
//! Requests are one `POST /req` each, the body being the request frame and
//! the response the reply frame. Publishes go into a bounded ring buffer that
//! subscribers long-poll through `POST /message/updates`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Notify};
use tower_http::trace::TraceLayer;

use saltline_channel::error::TransportError;
use saltline_channel::req_server::ReqServerChannel;
use saltline_channel::transport::{
    PubClientTransport, PubServerTransport, ReplyEvent, ReqClientTransport, ReqServerTransport,
};
use saltline_core::config::HttpConfig;
use saltline_core::wire::{HEADER_LEN, MAX_BODY_LEN};

/// Extra time a client waits beyond the server's long-poll bound.
const POLL_GRACE: Duration = Duration::from_secs(10);

fn endpoint(uri: &str, path: &str) -> String {
    let base = uri.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}{path}")
    } else {
        format!("http://{base}{path}")
    }
}

fn http_err(e: reqwest::Error) -> TransportError {
    TransportError::Http(e.to_string())
}

// ── Message buffer ────────────────────────────────────────────────────────────

struct Buffered {
    cursor: u64,
    topics: Option<Vec<String>>,
    message: String,
}

struct BufferInner {
    next_cursor: u64,
    messages: VecDeque<Buffered>,
}

/// Bounded ring of broadcast messages. Each message gets the next cursor; a
/// reader holding cursor `c` has seen everything before `c`.
pub struct MessageBuffer {
    capacity: usize,
    inner: parking_lot::Mutex<BufferInner>,
    notify: Notify,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: parking_lot::Mutex::new(BufferInner {
                next_cursor: 0,
                messages: VecDeque::with_capacity(capacity),
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, message: String, topics: Option<Vec<String>>) -> u64 {
        let cursor = {
            let mut inner = self.inner.lock();
            let cursor = inner.next_cursor;
            inner.next_cursor += 1;
            inner.messages.push_back(Buffered {
                cursor,
                topics,
                message,
            });
            while inner.messages.len() > self.capacity {
                inner.messages.pop_front();
            }
            cursor
        };
        self.notify.notify_waiters();
        cursor
    }

    /// Cursor a new reader starts from.
    pub fn head(&self) -> u64 {
        self.inner.lock().next_cursor
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffered messages at or after `cursor` visible to `node_id`, and the
    /// cursor to ask with next.
    pub fn since(&self, cursor: u64, node_id: Option<&str>) -> (Vec<String>, u64) {
        let inner = self.inner.lock();
        let messages = inner
            .messages
            .iter()
            .filter(|m| m.cursor >= cursor)
            .filter(|m| match (&m.topics, node_id) {
                (Some(topics), Some(id)) => topics.iter().any(|t| t == id),
                _ => true,
            })
            .map(|m| m.message.clone())
            .collect();
        (messages, inner.next_cursor)
    }

    /// Like [`since`](Self::since), but waits up to `timeout` for something
    /// to arrive when nothing is buffered yet.
    pub async fn wait_since(&self, cursor: u64, node_id: Option<&str>, timeout: Duration) -> (Vec<String>, u64) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before looking so a push in between is not missed
            notified.as_mut().enable();

            let (messages, next) = self.since(cursor, node_id);
            if !messages.is_empty() {
                return (messages, next);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.since(cursor, node_id);
            }
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpdatesForm {
    pub cursor: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatesResponse {
    pub messages: Vec<String>,
    pub cursor: String,
}

#[derive(Clone)]
struct PubState {
    buffer: Arc<MessageBuffer>,
    long_poll: Duration,
}

async fn handle_req(State(channel): State<Arc<ReqServerChannel>>, body: Bytes) -> Response {
    let reply = channel.handle_frame(&body).await;
    let content_type = (header::CONTENT_TYPE, "application/octet-stream");
    if reply.close {
        (StatusCode::OK, [content_type, (header::CONNECTION, "close")], reply.frame).into_response()
    } else {
        (StatusCode::OK, [content_type], reply.frame).into_response()
    }
}

async fn handle_updates(
    State(state): State<PubState>,
    Form(form): Form<UpdatesForm>,
) -> Result<Json<UpdatesResponse>, (StatusCode, String)> {
    let Some(cursor) = form.cursor.filter(|c| !c.is_empty()) else {
        return Ok(Json(UpdatesResponse {
            messages: Vec::new(),
            cursor: state.buffer.head().to_string(),
        }));
    };
    let cursor: u64 = cursor
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "cursor must be an integer".to_string()))?;

    let (messages, next) = state
        .buffer
        .wait_since(cursor, form.id.as_deref(), state.long_poll)
        .await;
    Ok(Json(UpdatesResponse {
        messages,
        cursor: next.to_string(),
    }))
}

async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

async fn run_app(
    listener: TcpListener,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

pub struct HttpReqServer {
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl HttpReqServer {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let (listener, local_addr) = bind(addr).await?;
        tracing::info!(%local_addr, "http request server listening");
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
impl ReqServerTransport for HttpReqServer {
    async fn serve(
        self: Arc<Self>,
        channel: Arc<ReqServerChannel>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| TransportError::Config("request server is already serving".into()))?;
        let app = Router::new()
            .route(
                "/req",
                post(handle_req).layer(DefaultBodyLimit::max(HEADER_LEN + MAX_BODY_LEN)),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(channel);
        run_app(listener, app, shutdown).await
    }
}

pub struct HttpPubServer {
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    buffer: Arc<MessageBuffer>,
    long_poll: Duration,
}

impl HttpPubServer {
    pub async fn bind(addr: &str, config: &HttpConfig) -> Result<Self, TransportError> {
        let (listener, local_addr) = bind(addr).await?;
        tracing::info!(%local_addr, capacity = config.buffer_capacity, "http publish server listening");
        Ok(Self {
            listener: parking_lot::Mutex::new(Some(listener)),
            local_addr,
            buffer: Arc::new(MessageBuffer::new(config.buffer_capacity)),
            long_poll: config.long_poll_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn buffer(&self) -> &Arc<MessageBuffer> {
        &self.buffer
    }

    /// Serve long-poll subscribers until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| TransportError::Config("publish server is already running".into()))?;
        let app = Router::new()
            .route("/message/updates", post(handle_updates))
            .layer(TraceLayer::new_for_http())
            .with_state(PubState {
                buffer: self.buffer.clone(),
                long_poll: self.long_poll,
            });
        run_app(listener, app, shutdown).await
    }
}

#[async_trait]
impl PubServerTransport for HttpPubServer {
    async fn publish_string(&self, message: String, topics: Option<&[String]>) -> Result<(), TransportError> {
        let cursor = self.buffer.push(message, topics.map(<[String]>::to_vec));
        tracing::trace!(cursor, "publish buffered");
        Ok(())
    }

    fn topic_support(&self) -> bool {
        true
    }
}

// ── Request client ────────────────────────────────────────────────────────────

pub struct HttpReqClient {
    client: reqwest::Client,
    url: String,
    tx: mpsc::UnboundedSender<ReplyEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReplyEvent>>,
    closed: AtomicBool,
    closing: Notify,
}

impl HttpReqClient {
    pub fn new(client: reqwest::Client, master_uri: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            client,
            url: endpoint(master_uri, "/req"),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }
}

#[async_trait]
impl ReqClientTransport for HttpReqClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn publish_bytes(&self, correlation_id: &str, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(frame);
        let tx = self.tx.clone();
        let correlation_id = correlation_id.to_string();
        tokio::spawn(async move {
            let result = async {
                let response = request.send().await?.error_for_status()?;
                response.bytes().await
            }
            .await;
            let event = match result {
                Ok(frame) => ReplyEvent::Reply {
                    correlation_id,
                    frame,
                },
                Err(e) => ReplyEvent::Failed {
                    correlation_id,
                    error: http_err(e),
                },
            };
            let _ = tx.send(event);
        });
        Ok(())
    }

    async fn recv_reply(&self) -> Result<Option<ReplyEvent>, TransportError> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            event = rx.recv() => Ok(event),
            _ = closing => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closing.notify_waiters();
    }
}

// ── Publish client ────────────────────────────────────────────────────────────

#[derive(Default)]
struct PollState {
    node_id: Option<String>,
    cursor: Option<String>,
    backlog: VecDeque<Bytes>,
}

pub struct HttpPubClient {
    client: reqwest::Client,
    url: String,
    poll_timeout: Duration,
    state: tokio::sync::Mutex<PollState>,
    closed: AtomicBool,
}

impl HttpPubClient {
    pub fn new(client: reqwest::Client, publish_uri: &str, config: &HttpConfig) -> Self {
        Self {
            client,
            url: endpoint(publish_uri, "/message/updates"),
            poll_timeout: config.long_poll_timeout() + POLL_GRACE,
            state: tokio::sync::Mutex::new(PollState::default()),
            closed: AtomicBool::new(false),
        }
    }

    async fn poll(&self, cursor: Option<&str>, node_id: Option<&str>) -> Result<UpdatesResponse, TransportError> {
        let mut form: Vec<(&str, &str)> = Vec::with_capacity(2);
        if let Some(cursor) = cursor {
            form.push(("cursor", cursor));
        }
        if let Some(id) = node_id {
            form.push(("id", id));
        }
        self.client
            .post(&self.url)
            .timeout(self.poll_timeout)
            .form(&form)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http_err)?
            .json::<UpdatesResponse>()
            .await
            .map_err(http_err)
    }
}

#[async_trait]
impl PubClientTransport for HttpPubClient {
    async fn connect(&self, node_id: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let head = self.poll(None, Some(node_id)).await?;
        let mut state = self.state.lock().await;
        state.node_id = Some(node_id.to_string());
        // a reconnect keeps its place so nothing buffered meanwhile is lost
        if state.cursor.is_none() {
            state.cursor = Some(head.cursor);
        }
        tracing::debug!(url = %self.url, node = node_id, "long-poll subscriber ready");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        let mut state = self.state.lock().await;
        loop {
            if let Some(frame) = state.backlog.pop_front() {
                return Ok(Some(frame));
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            let Some(cursor) = state.cursor.clone() else {
                return Err(TransportError::NotConnected);
            };
            let update = self.poll(Some(&cursor), state.node_id.as_deref()).await?;
            state.cursor = Some(update.cursor);
            for message in update.messages {
                match B64.decode(message.as_bytes()) {
                    Ok(frame) => state.backlog.push_back(Bytes::from(frame)),
                    Err(e) => tracing::warn!(error = %e, "dropping non-base64 publish"),
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
