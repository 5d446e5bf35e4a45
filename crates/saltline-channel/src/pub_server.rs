//! Publish server channel.
//!
//! `publish` never touches the network: it builds the frame and queues it.
//! A [`PublishDaemon`] drains the queue into the backing transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

use saltline_core::config::{Crypt, SaltlineConfig};
use saltline_core::payload::{Load, Payload};
use saltline_core::wire::{Envelope, HEAD_TOPICS};

use crate::error::{AuthError, ChannelError, TransportError};
use crate::keys::KeyAuthority;
use crate::transport::PubServerTransport;

/// Publishes waiting for the daemon before `publish` starts refusing.
pub const PUBLISH_QUEUE_DEPTH: usize = 1024;

/// Topic list for a publish load: only explicit `list` targets are routed,
/// and never when relaying for lower masters.
pub fn topic_list(load: &Load, order_masters: bool) -> Option<Vec<String>> {
    if order_masters {
        return None;
    }
    if load.get("tgt_type").and_then(Value::as_str) != Some("list") {
        return None;
    }
    match load.get("tgt") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        Some(Value::String(single)) => Some(vec![single.clone()]),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub crypt: Crypt,
    pub order_masters: bool,
}

impl PublishOptions {
    pub fn from_config(config: &SaltlineConfig) -> Self {
        Self {
            crypt: config.channel.crypt,
            order_masters: config.publish.order_masters,
        }
    }
}

#[derive(Debug)]
struct Outbound {
    frame: Bytes,
    topics: Option<Vec<String>>,
}

pub struct PubServerChannel {
    keys: Arc<KeyAuthority>,
    opts: PublishOptions,
    serial: AtomicU64,
    tx: mpsc::Sender<Outbound>,
}

/// Drains queued publishes into a transport.
pub struct PublishDaemon {
    rx: mpsc::Receiver<Outbound>,
}

impl PubServerChannel {
    pub fn new(keys: Arc<KeyAuthority>, opts: PublishOptions) -> (Self, PublishDaemon) {
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
        // Seeded from the clock so serials keep increasing across restarts.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1);
        let channel = Self {
            keys,
            opts,
            serial: AtomicU64::new(seed),
            tx,
        };
        (channel, PublishDaemon { rx })
    }

    /// Queue `load` for every subscriber it targets. Returns the serial it
    /// was published under.
    pub fn publish(&self, mut load: Load) -> Result<u64, ChannelError> {
        let topics = topic_list(&load, self.opts.order_masters);
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        load.insert("serial".to_string(), Value::from(serial));

        let payload = match self.opts.crypt {
            Crypt::Clear => Payload::clear(load),
            Crypt::Aes => {
                let ciphertext = self
                    .keys
                    .session()
                    .dumps(&Value::Object(load), None)
                    .map_err(AuthError::Crypto)?;
                let payload = Payload::aes(&ciphertext);
                match self.keys.sign(&ciphertext) {
                    Some(sig) => payload.with_signature(&sig),
                    None => payload,
                }
            }
        };

        let mut envelope = Envelope::new(payload.to_value());
        if let Some(topics) = &topics {
            envelope = envelope.with_head(HEAD_TOPICS, topics.clone());
        }
        let frame = envelope.encode()?;
        match self.tx.try_send(Outbound { frame, topics }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(serial, "publish queue full, dropping publish");
                return Err(ChannelError::QueueFull);
            }
            Err(TrySendError::Closed(_)) => return Err(ChannelError::Closed),
        }
        tracing::trace!(serial, "publish queued");
        Ok(serial)
    }
}

impl PublishDaemon {
    pub async fn run(
        mut self,
        transport: Arc<dyn PubServerTransport>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                next = self.rx.recv() => {
                    let Some(out) = next else {
                        tracing::debug!("publish channel dropped, daemon exiting");
                        return Ok(());
                    };
                    if let Err(e) = transport.publish_bytes(out.frame, out.topics.as_deref()).await {
                        if !e.is_disconnect() {
                            return Err(e);
                        }
                        tracing::warn!(error = %e, "publish failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("publish daemon shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use saltline_core::config::AuthConfig;
    use saltline_core::crypto;
    use saltline_core::payload::Enc;
    use serde_json::json;

    fn load(value: Value) -> Load {
        match value {
            Value::Object(map) => map,
            _ => Load::new(),
        }
    }

    fn keys(sign: bool) -> (Arc<KeyAuthority>, std::path::PathBuf) {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("saltline-pub-test-{}-{n}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let keys = KeyAuthority::new(&dir, AuthConfig::default(), sign).unwrap();
        (Arc::new(keys), dir)
    }

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(Bytes, Option<Vec<String>>)>>,
    }

    #[async_trait]
    impl PubServerTransport for Capture {
        async fn publish_string(&self, _m: String, _t: Option<&[String]>) -> Result<(), TransportError> {
            unreachable!("capture overrides publish_bytes")
        }

        async fn publish_bytes(&self, frame: Bytes, topics: Option<&[String]>) -> Result<(), TransportError> {
            self.sent.lock().push((frame, topics.map(<[String]>::to_vec)));
            Ok(())
        }
    }

    #[test]
    fn list_targets_become_topics() {
        let l = load(json!({"tgt_type": "list", "tgt": ["m1", "m2"]}));
        assert_eq!(topic_list(&l, false), Some(vec!["m1".to_string(), "m2".to_string()]));
        assert_eq!(topic_list(&l, true), None);

        let glob = load(json!({"tgt_type": "glob", "tgt": "*"}));
        assert_eq!(topic_list(&glob, false), None);
        assert_eq!(topic_list(&load(json!({"tgt": ["m1"]})), false), None);
    }

    #[tokio::test]
    async fn published_frames_are_encrypted_signed_and_serial() {
        let (keys, dir) = keys(true);
        let (channel, daemon) = PubServerChannel::new(
            keys.clone(),
            PublishOptions {
                crypt: Crypt::Aes,
                order_masters: false,
            },
        );
        let capture = Arc::new(Capture::default());
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(daemon.run(capture.clone(), stop_rx));

        let first = channel
            .publish(load(json!({"fun": "test.ping", "tgt_type": "list", "tgt": ["m1"]})))
            .unwrap();
        let second = channel.publish(load(json!({"fun": "test.ping", "tgt": "*"}))).unwrap();
        assert!(second > first);

        while capture.sent.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();

        let sent = capture.sent.lock().clone();
        assert_eq!(sent[0].1, Some(vec!["m1".to_string()]));
        assert_eq!(sent[1].1, None);

        let env = Envelope::decode(&sent[0].0).unwrap();
        assert_eq!(env.topics(), Some(vec!["m1"]));
        let payload = Payload::from_value(env.body).unwrap();
        assert_eq!(payload.enc, Enc::Aes);
        let ciphertext = payload.ciphertext().unwrap();
        let sig = payload.signature().unwrap().unwrap();
        let sign_pub = keys.signing_public().unwrap();
        crypto::verify(&sign_pub, &ciphertext, &sig).unwrap();

        let opened = keys.session().loads(&ciphertext, None).unwrap();
        assert_eq!(opened["serial"], first);
        assert_eq!(opened["fun"], "test.ping");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn clear_publish_is_unsigned() {
        let (keys, dir) = keys(false);
        let (channel, mut daemon) = PubServerChannel::new(
            keys,
            PublishOptions {
                crypt: Crypt::Clear,
                order_masters: false,
            },
        );
        channel.publish(load(json!({"fun": "x"}))).unwrap();
        let out = daemon.rx.recv().await.unwrap();
        let payload = Payload::from_value(Envelope::decode(&out.frame).unwrap().body).unwrap();
        assert_eq!(payload.enc, Enc::Clear);
        assert_eq!(payload.load["fun"], "x");
        assert!(payload.sig.is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stalled_daemon_bounds_the_queue() {
        let (keys, dir) = keys(false);
        let (channel, mut daemon) = PubServerChannel::new(
            keys,
            PublishOptions {
                crypt: Crypt::Clear,
                order_masters: false,
            },
        );
        for n in 0..PUBLISH_QUEUE_DEPTH {
            channel.publish(load(json!({"fun": "x", "arg": [n]}))).unwrap();
        }
        assert!(matches!(
            channel.publish(load(json!({"fun": "x"}))),
            Err(ChannelError::QueueFull)
        ));

        // draining one frees a slot
        daemon.rx.recv().await.unwrap();
        channel.publish(load(json!({"fun": "x"}))).unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
