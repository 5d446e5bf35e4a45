//! Primitives every backing transport provides.
//!
//! Channels own the crypto, auth and retry logic; a transport only moves
//! frames. Backends live in `saltline-transport`.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::req_client::ChannelOptions;
use crate::req_server::ReqServerChannel;

/// Something the request transport observed for a pending request.
#[derive(Debug)]
pub enum ReplyEvent {
    Reply {
        correlation_id: String,
        frame: Bytes,
    },
    /// The transport gave up on one request without losing the connection.
    Failed {
        correlation_id: String,
        error: TransportError,
    },
}

/// Client half of a request/response transport.
#[async_trait]
pub trait ReqClientTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send one request frame tagged with its correlation id.
    async fn publish_bytes(&self, correlation_id: &str, frame: Bytes) -> Result<(), TransportError>;

    /// Next reply event. `Ok(None)` once the transport is closed.
    async fn recv_reply(&self) -> Result<Option<ReplyEvent>, TransportError>;

    async fn close(&self);
}

/// Server half of a request/response transport.
#[async_trait]
pub trait ReqServerTransport: Send + Sync + 'static {
    /// Feed inbound frames to `channel` and write its replies back until
    /// `shutdown` fires.
    async fn serve(
        self: Arc<Self>,
        channel: Arc<ReqServerChannel>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError>;
}

/// Outbound side of the publish fan-out.
#[async_trait]
pub trait PubServerTransport: Send + Sync + 'static {
    async fn publish_string(
        &self,
        message: String,
        topics: Option<&[String]>,
    ) -> Result<(), TransportError>;

    /// Publish a binary frame. String-only backends get it base64 encoded.
    async fn publish_bytes(&self, frame: Bytes, topics: Option<&[String]>) -> Result<(), TransportError> {
        self.publish_string(B64.encode(&frame), topics).await
    }

    /// Whether the backend filters by topic list itself. When false,
    /// subscribers filter on the topic list carried in the frame head.
    fn topic_support(&self) -> bool {
        false
    }
}

/// Subscriber side of the publish fan-out.
#[async_trait]
pub trait PubClientTransport: Send + Sync + 'static {
    async fn connect(&self, node_id: &str) -> Result<(), TransportError>;

    /// Next publish frame. `Ok(None)` once the transport is closed.
    async fn recv(&self) -> Result<Option<Bytes>, TransportError>;

    async fn close(&self);
}

/// Builds client transports for channels created by a registry.
pub trait TransportFactory: Send + Sync + 'static {
    fn req_client(&self, opts: &ChannelOptions) -> Result<Arc<dyn ReqClientTransport>, TransportError>;

    fn pub_client(&self, opts: &ChannelOptions) -> Result<Arc<dyn PubClientTransport>, TransportError>;
}
