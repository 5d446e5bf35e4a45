//! Queue/topic broker primitives behind the message-queue transport.
//!
//! Semantics follow a hosted queue service: messages stay in a queue until
//! deleted by receipt, a received message is hidden for a visibility timeout
//! and then redelivered, and publishing to a topic copies the message into
//! every subscribed queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use saltline_channel::error::TransportError;

/// String-valued message attributes.
pub type Attributes = HashMap<String, String>;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue {0} does not exist")]
    QueueDoesNotExist(String),
    #[error("topic {0} does not exist")]
    TopicDoesNotExist(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

impl From<BrokerError> for TransportError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::QueueDoesNotExist(queue) => TransportError::QueueDoesNotExist(queue),
            other => TransportError::Broker(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub body: String,
    pub attributes: Attributes,
    /// Handle for deleting this delivery.
    pub receipt: String,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Create a queue. Creating an existing queue is a no-op.
    async fn create_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn send_message(&self, queue: &str, body: String, attributes: Attributes) -> Result<(), BrokerError>;

    /// Up to `max` messages, waiting at most `wait` for the first one.
    async fn receive_messages(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;

    async fn delete_message(&self, queue: &str, receipt: &str) -> Result<(), BrokerError>;

    async fn create_topic(&self, name: &str) -> Result<(), BrokerError>;

    /// Deliver every later publish on `topic` into `queue`.
    async fn subscribe(&self, topic: &str, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, body: String, attributes: Attributes) -> Result<(), BrokerError>;
}

// ── In-memory broker ──────────────────────────────────────────────────────────

#[derive(Clone)]
struct Stored {
    body: String,
    attributes: Attributes,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Stored>,
    in_flight: HashMap<String, (Instant, Stored)>,
}

#[derive(Default)]
struct QueueState {
    inner: parking_lot::Mutex<QueueInner>,
    notify: Notify,
}

/// Broker living in this process. Shared by cloning the `Arc`.
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<QueueState>>,
    topics: DashMap<String, Vec<String>>,
    receipts: AtomicU64,
    visibility: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            topics: DashMap::new(),
            receipts: AtomicU64::new(0),
            visibility,
        }
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueState>, BrokerError> {
        self.queues
            .get(name)
            .map(|q| q.clone())
            .ok_or_else(|| BrokerError::QueueDoesNotExist(name.to_string()))
    }

    /// Messages waiting to be received, in flight ones excluded.
    pub fn depth(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map_or(0, |q| q.inner.lock().ready.len())
    }

    fn take_batch(&self, queue: &QueueState, max: usize) -> Vec<BrokerMessage> {
        let mut inner = queue.inner.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, (visible_at, _))| *visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((_, stored)) = inner.in_flight.remove(&receipt) {
                inner.ready.push_front(stored);
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(stored) = inner.ready.pop_front() else {
                break;
            };
            let receipt = format!("r-{}", self.receipts.fetch_add(1, Ordering::Relaxed));
            batch.push(BrokerMessage {
                body: stored.body.clone(),
                attributes: stored.attributes.clone(),
                receipt: receipt.clone(),
            });
            inner.in_flight.insert(receipt, (now + self.visibility, stored));
        }
        batch
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn create_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn send_message(&self, queue: &str, body: String, attributes: Attributes) -> Result<(), BrokerError> {
        let q = self.queue(queue)?;
        q.inner.lock().ready.push_back(Stored { body, attributes });
        q.notify.notify_waiters();
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let q = self.queue(queue)?;
        let deadline = Instant::now() + wait;
        loop {
            let notified = q.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch(&q, max.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            // wake at the earliest redelivery too
            let next_visible = q
                .inner
                .lock()
                .in_flight
                .values()
                .map(|(at, _)| *at)
                .min()
                .map_or(deadline, |at| at.min(deadline));
            if tokio::time::timeout_at(next_visible, notified).await.is_err() && next_visible >= deadline {
                return Ok(self.take_batch(&q, max.max(1)));
            }
        }
    }

    async fn delete_message(&self, queue: &str, receipt: &str) -> Result<(), BrokerError> {
        let q = self.queue(queue)?;
        q.inner.lock().in_flight.remove(receipt);
        Ok(())
    }

    async fn create_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.topics.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, queue: &str) -> Result<(), BrokerError> {
        self.queue(queue)?;
        let mut subscribers = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::TopicDoesNotExist(topic.to_string()))?;
        if !subscribers.iter().any(|q| q == queue) {
            subscribers.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, body: String, attributes: Attributes) -> Result<(), BrokerError> {
        let subscribers = self
            .topics
            .get(topic)
            .map(|s| s.clone())
            .ok_or_else(|| BrokerError::TopicDoesNotExist(topic.to_string()))?;
        for queue in subscribers {
            if let Err(e) = self.send_message(&queue, body.clone(), attributes.clone()).await {
                tracing::warn!(topic, queue = %queue, error = %e, "topic delivery failed");
            }
        }
        Ok(())
    }
}
