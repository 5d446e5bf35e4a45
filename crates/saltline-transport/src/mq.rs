//! Message-queue transport over a [`Broker`].
//!
//! Topology:
//!   <master>             requests from every minion
//!   <node>_reply         replies for one minion, matched by `correlation_id`
//!   <publisher topic>    fan-out of publishes
//!   <node>               one minion's subscription to the publisher topic
//!
//! Frames travel base64 encoded since queue bodies are strings.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use saltline_channel::error::TransportError;
use saltline_channel::req_server::{ReqServerChannel, BAD_LOAD};
use saltline_channel::transport::{
    PubClientTransport, PubServerTransport, ReplyEvent, ReqClientTransport, ReqServerTransport,
};
use saltline_core::config::MqConfig;
use saltline_core::wire::Envelope;
use serde_json::json;

use crate::broker::{Attributes, Broker, BrokerMessage};

pub const MAX_QUEUE_NAME_LEN: usize = 80;
pub const ATTR_REPLY_QUEUE: &str = "reply_queue_name";
pub const ATTR_CORRELATION_ID: &str = "correlation_id";

/// Broker-safe queue name.
pub fn queue_name(base: &str) -> String {
    base.replace(['-', '.'], "_")
}

pub fn reply_queue_name(base: &str) -> Result<String, TransportError> {
    let name = format!("{}_reply", queue_name(base));
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(TransportError::Config(format!(
            "reply queue name {name} exceeds {MAX_QUEUE_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

fn decode_body(body: &str) -> Result<Bytes, TransportError> {
    B64.decode(body.as_bytes())
        .map(Bytes::from)
        .map_err(|e| TransportError::Broker(format!("message body is not base64: {e}")))
}

// ── Consume loop ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ConsumeOptions {
    pub batch_size: usize,
    pub wait: Duration,
    pub poll_sleep: Duration,
}

impl ConsumeOptions {
    pub fn from_config(config: &MqConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            wait: config.wait_time(),
            poll_sleep: config.poll_sleep(),
        }
    }
}

/// Poll `queue` until `shutdown` fires. Each message is deleted once
/// `handle` succeeds; a failed message is left for redelivery. Broker errors
/// end the loop.
pub async fn consume<F, Fut>(
    broker: &dyn Broker,
    queue: &str,
    opts: ConsumeOptions,
    shutdown: &mut broadcast::Receiver<()>,
    mut handle: F,
) -> Result<(), TransportError>
where
    F: FnMut(BrokerMessage) -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    loop {
        let batch = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            batch = broker.receive_messages(queue, opts.batch_size, opts.wait) => batch?,
        };
        let received = batch.len();

        for message in batch {
            let receipt = message.receipt.clone();
            match handle(message).await {
                Ok(()) => broker.delete_message(queue, &receipt).await?,
                Err(e) => tracing::warn!(queue, error = %e, "message handling failed, leaving for redelivery"),
            }
        }

        if received < opts.batch_size {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(opts.poll_sleep) => {}
            }
        }
    }
}

// ── Request client ────────────────────────────────────────────────────────────

pub struct MqReqClient {
    broker: Arc<dyn Broker>,
    master_queue: String,
    reply_queue: String,
    opts: ConsumeOptions,
    events_tx: mpsc::UnboundedSender<Result<ReplyEvent, TransportError>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ReplyEvent, TransportError>>>,
    stop: broadcast::Sender<()>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    closing: Notify,
}

impl MqReqClient {
    pub fn new(broker: Arc<dyn Broker>, config: &MqConfig, node_id: &str) -> Result<Self, TransportError> {
        let reply_queue = reply_queue_name(&config.consumer_queue_for(node_id))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop, _) = broadcast::channel(1);
        Ok(Self {
            broker,
            master_queue: queue_name(&config.master_queue_name),
            reply_queue,
            opts: ConsumeOptions::from_config(config),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            stop,
            consumer: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }
}

#[async_trait]
impl ReqClientTransport for MqReqClient {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.broker.create_queue(&self.reply_queue).await?;

        let mut consumer = self.consumer.lock();
        if consumer.as_ref().is_some_and(|c| !c.is_finished()) {
            return Ok(());
        }
        let broker = self.broker.clone();
        let queue = self.reply_queue.clone();
        let opts = self.opts;
        let events = self.events_tx.clone();
        let mut stop = self.stop.subscribe();
        *consumer = Some(tokio::spawn(async move {
            let result = consume(broker.as_ref(), &queue, opts, &mut stop, |message| {
                let events = events.clone();
                async move {
                    let Some(correlation_id) = message.attributes.get(ATTR_CORRELATION_ID).cloned() else {
                        tracing::warn!("reply without correlation id dropped");
                        return Ok(());
                    };
                    let frame = decode_body(&message.body)?;
                    let _ = events.send(Ok(ReplyEvent::Reply {
                        correlation_id,
                        frame,
                    }));
                    Ok(())
                }
            })
            .await;
            if let Err(e) = result {
                tracing::error!(queue = %queue, error = %e, "reply consumer stopped");
                let _ = events.send(Err(e));
            }
        }));
        tracing::debug!(reply_queue = %self.reply_queue, "reply consumer started");
        Ok(())
    }

    async fn publish_bytes(&self, correlation_id: &str, frame: Bytes) -> Result<(), TransportError> {
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_REPLY_QUEUE.to_string(), self.reply_queue.clone());
        attributes.insert(ATTR_CORRELATION_ID.to_string(), correlation_id.to_string());
        self.broker
            .send_message(&self.master_queue, B64.encode(&frame), attributes)
            .await?;
        Ok(())
    }

    async fn recv_reply(&self) -> Result<Option<ReplyEvent>, TransportError> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut events = self.events_rx.lock().await;
        tokio::select! {
            event = events.recv() => event.transpose(),
            _ = closing => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.stop.send(());
        self.closing.notify_waiters();
    }
}

// ── Request server ────────────────────────────────────────────────────────────

pub struct MqReqServer {
    broker: Arc<dyn Broker>,
    queue: String,
    opts: ConsumeOptions,
}

impl MqReqServer {
    /// Create the master request queue.
    pub async fn bind(broker: Arc<dyn Broker>, config: &MqConfig) -> Result<Self, TransportError> {
        let queue = queue_name(&config.master_queue_name);
        broker.create_queue(&queue).await?;
        tracing::info!(queue = %queue, region = %config.region, "request queue ready");
        Ok(Self {
            broker,
            queue,
            opts: ConsumeOptions::from_config(config),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl ReqServerTransport for MqReqServer {
    async fn serve(
        self: Arc<Self>,
        channel: Arc<ReqServerChannel>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        let broker = self.broker.clone();
        consume(self.broker.as_ref(), &self.queue, self.opts, &mut shutdown, |message| {
            let channel = channel.clone();
            let broker = broker.clone();
            async move {
                let reply = match decode_body(&message.body) {
                    Ok(frame) => channel.handle_frame(&frame).await.frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable request, answering bad load");
                        Envelope::new(json!(BAD_LOAD)).encode()?
                    }
                };
                let Some(reply_queue) = message.attributes.get(ATTR_REPLY_QUEUE) else {
                    tracing::warn!("request without reply queue, reply dropped");
                    return Ok(());
                };
                let mut attributes = Attributes::new();
                if let Some(id) = message.attributes.get(ATTR_CORRELATION_ID) {
                    attributes.insert(ATTR_CORRELATION_ID.to_string(), id.clone());
                }
                broker
                    .send_message(reply_queue, B64.encode(&reply), attributes)
                    .await?;
                Ok(())
            }
        })
        .await
    }
}

// ── Publish server ────────────────────────────────────────────────────────────

pub struct MqPubServer {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl MqPubServer {
    pub async fn bind(broker: Arc<dyn Broker>, config: &MqConfig) -> Result<Self, TransportError> {
        let topic = queue_name(&config.publisher_topic);
        broker.create_topic(&topic).await?;
        tracing::info!(topic = %topic, region = %config.region, "publisher topic ready");
        Ok(Self { broker, topic })
    }
}

#[async_trait]
impl PubServerTransport for MqPubServer {
    async fn publish_string(&self, message: String, _topics: Option<&[String]>) -> Result<(), TransportError> {
        self.broker.publish(&self.topic, message, Attributes::new()).await?;
        Ok(())
    }
}

// ── Publish client ────────────────────────────────────────────────────────────

pub struct MqPubClient {
    broker: Arc<dyn Broker>,
    config: MqConfig,
    topic: String,
    opts: ConsumeOptions,
    queue: parking_lot::Mutex<Option<String>>,
    backlog: tokio::sync::Mutex<std::collections::VecDeque<Bytes>>,
    closed: AtomicBool,
}

impl MqPubClient {
    pub fn new(broker: Arc<dyn Broker>, config: &MqConfig) -> Self {
        Self {
            broker,
            topic: queue_name(&config.publisher_topic),
            opts: ConsumeOptions::from_config(config),
            config: config.clone(),
            queue: parking_lot::Mutex::new(None),
            backlog: tokio::sync::Mutex::new(Default::default()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PubClientTransport for MqPubClient {
    async fn connect(&self, node_id: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let queue = queue_name(&self.config.consumer_queue_for(node_id));
        self.broker.create_queue(&queue).await?;
        self.broker.subscribe(&self.topic, &queue).await?;
        tracing::debug!(topic = %self.topic, queue = %queue, "subscribed to publisher topic");
        *self.queue.lock() = Some(queue);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>, TransportError> {
        let mut backlog = self.backlog.lock().await;
        loop {
            if let Some(frame) = backlog.pop_front() {
                return Ok(Some(frame));
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            let queue = self.queue.lock().clone().ok_or(TransportError::NotConnected)?;
            let batch = self
                .broker
                .receive_messages(&queue, self.opts.batch_size, self.opts.wait)
                .await?;
            if batch.is_empty() {
                tokio::time::sleep(self.opts.poll_sleep).await;
                continue;
            }
            for message in batch {
                match decode_body(&message.body) {
                    Ok(frame) => backlog.push_back(frame),
                    Err(e) => tracing::warn!(error = %e, "dropping undecodable publish"),
                }
                self.broker.delete_message(&queue, &message.receipt).await?;
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
