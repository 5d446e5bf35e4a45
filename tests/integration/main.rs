//! saltline integration test harness.
//!
//! Every test starts an in-process master on loopback (port 0) for one
//! backend and talks to it through real client transports:
//!
//!   cargo test --test integration
//!
//! Each test owns its master and key directories; nothing is shared.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use saltline_channel::pub_client::AsyncPubChannel;
use saltline_channel::req_client::{AsyncReqChannel, ChannelOptions, ChannelRegistry};
use saltline_channel::transport::TransportFactory;
use saltline_core::config::{Crypt, SaltlineConfig, TransportKind};
use saltline_core::payload::Load;
use saltline_transport::{InMemoryBroker, Transports};
use saltlined::Master;

mod longpoll;
mod mq;
mod publish;
mod request;

// ── Harness ───────────────────────────────────────────────────────────────────

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// Reply and publish waits. Generous, loopback answers in milliseconds.
pub const WAIT: Duration = Duration::from_secs(10);

/// Build a load from a JSON object literal.
pub fn load(value: serde_json::Value) -> Load {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A running master plus what minions need to reach it.
pub struct Cluster {
    pub master: Master,
    pub broker: Arc<InMemoryBroker>,
    /// Config a minion starts from; endpoints point at the master.
    pub minion_base: SaltlineConfig,
    pub registry: Arc<ChannelRegistry>,
    root: PathBuf,
}

impl Cluster {
    pub async fn start(transport: TransportKind) -> Result<Self> {
        Self::start_with(transport, |_| {}).await
    }

    /// Start a master, letting `tweak` adjust its config first.
    pub async fn start_with(transport: TransportKind, tweak: impl FnOnce(&mut SaltlineConfig)) -> Result<Self> {
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!("saltline-it-{}-{n}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);

        let mut config = SaltlineConfig::default();
        config.identity.node_id = "master".into();
        config.identity.pki_dir = root.join("master");
        config.master.req_uri = "127.0.0.1:0".into();
        config.master.publish_uri = "127.0.0.1:0".into();
        config.channel.transport = transport;
        config.channel.timeout_secs = 5;
        config.auth.auto_accept = true;
        config.mq.wait_time_secs = 1;
        config.mq.poll_sleep_ms = 20;
        config.http.long_poll_timeout_secs = 2;
        tweak(&mut config);

        let broker = Arc::new(InMemoryBroker::new());
        let master = Master::start(&config, broker.clone())
            .await
            .context("master failed to start")?;

        let mut minion_base = config.clone();
        if let Some(addr) = master.req_addr {
            minion_base.master.req_uri = addr.to_string();
        }
        if let Some(addr) = master.publish_addr {
            minion_base.master.publish_uri = addr.to_string();
        }

        let factory: Arc<dyn TransportFactory> = Arc::new(Transports::new(&minion_base, broker.clone()));
        Ok(Self {
            master,
            broker,
            minion_base,
            registry: ChannelRegistry::new(factory),
            root,
        })
    }

    /// Channel options for minion `node_id`, with its own key directory.
    pub fn minion(&self, node_id: &str, crypt: Crypt) -> ChannelOptions {
        let mut config = self.minion_base.clone();
        config.identity.node_id = node_id.to_string();
        config.identity.pki_dir = self.root.join(node_id);
        config.channel.crypt = crypt;
        ChannelOptions::from_config(&config)
    }

    pub fn channel(&self, node_id: &str, crypt: Crypt) -> Result<AsyncReqChannel> {
        self.registry
            .obtain(&self.minion(node_id, crypt))
            .context("failed to obtain request channel")
    }

    /// Subscribe `node_id` to publishes. Received loads arrive on the receiver.
    pub async fn subscribe(&self, node_id: &str) -> Result<(AsyncPubChannel, mpsc::UnboundedReceiver<Load>)> {
        let opts = self.minion(node_id, self.minion_base.channel.crypt);
        let req = Arc::new(self.registry.obtain(&opts)?);
        let transport = self.registry.factory().pub_client(&opts)?;
        let subscriber = AsyncPubChannel::new(req, transport);

        let (tx, rx) = mpsc::unbounded_channel();
        subscriber.on_recv(Some(Arc::new(move |load: Load| {
            let _ = tx.send(load);
        })));
        subscriber.connect().await.context("subscriber failed to connect")?;
        // the TCP publisher registers a subscriber after reading its hello
        if self.minion_base.channel.transport == TransportKind::Tcp {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok((subscriber, rx))
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.master.shutdown();
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Next publish on `rx`, or an error after [`WAIT`].
pub async fn next_publish(rx: &mut mpsc::UnboundedReceiver<Load>) -> Result<Load> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .context("no publish within the wait")?
        .context("subscriber stopped")
}

/// True if nothing arrives on `rx` for a short while.
pub async fn stays_quiet(rx: &mut mpsc::UnboundedReceiver<Load>) -> bool {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .is_err()
}
