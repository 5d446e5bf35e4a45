//! Master wiring: key authority, publisher and request channel on top of
//! the bound transports.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use saltline_channel::error::TransportError;
use saltline_channel::keys::KeyAuthority;
use saltline_channel::pub_server::{PubServerChannel, PublishOptions};
use saltline_channel::req_server::ReqServerChannel;
use saltline_core::config::SaltlineConfig;
use saltline_transport::{Broker, MasterTransports};

use crate::handler::MasterHandler;

/// A running master: key authority, publisher and the serving tasks.
pub struct Master {
    pub keys: Arc<KeyAuthority>,
    pub publisher: Arc<PubServerChannel>,
    pub req_addr: Option<SocketAddr>,
    pub publish_addr: Option<SocketAddr>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<Result<(), TransportError>>>,
}

impl Master {
    pub async fn start(config: &SaltlineConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let keys = Arc::new(
            KeyAuthority::new(
                &config.identity.pki_dir,
                config.auth.clone(),
                config.publish.sign_pub_messages,
            )
            .with_context(|| format!("failed to open pki dir {}", config.identity.pki_dir.display()))?,
        );
        let (publisher, daemon) = PubServerChannel::new(keys.clone(), PublishOptions::from_config(config));
        let publisher = Arc::new(publisher);
        let channel = Arc::new(ReqServerChannel::new(
            Arc::new(MasterHandler::new(publisher.clone())),
            keys.clone(),
        ));

        let transports = MasterTransports::bind(config, broker)
            .await
            .context("failed to bind master transport")?;
        let req_addr = transports.req_addr;
        let publish_addr = transports.publish_addr;
        tracing::info!(
            transport = ?config.channel.transport,
            req = ?req_addr,
            publish = ?publish_addr,
            "master listening"
        );

        let (shutdown, _) = broadcast::channel::<()>(1);
        let tasks = transports.spawn(channel, daemon, &shutdown);

        Ok(Self {
            keys,
            publisher,
            req_addr,
            publish_addr,
            shutdown,
            tasks,
        })
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for every serving task. The first task error is returned after
    /// all tasks have stopped.
    pub async fn wait(self) -> Result<()> {
        let mut first = None;
        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "master task failed");
                    first.get_or_insert(anyhow::Error::new(e));
                }
                Err(e) => {
                    tracing::error!(error = %e, "master task panicked");
                    first.get_or_insert(anyhow::anyhow!("master task panicked: {e}"));
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}
