//! saltline-transport — the backends channels move frames over: framed TCP,
//! HTTP long-poll, and a message-queue broker.

pub mod broker;
pub mod http;
pub mod mq;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use saltline_channel::error::TransportError;
use saltline_channel::pub_server::PublishDaemon;
use saltline_channel::req_client::ChannelOptions;
use saltline_channel::req_server::ReqServerChannel;
use saltline_channel::transport::{
    PubClientTransport, PubServerTransport, ReqClientTransport, ReqServerTransport, TransportFactory,
};
use saltline_core::config::{HttpConfig, MqConfig, SaltlineConfig, TransportKind};

pub use broker::{Broker, BrokerError, InMemoryBroker};

/// Client transports for every backend, selected per channel by
/// `ChannelOptions::transport`.
pub struct Transports {
    broker: Arc<dyn Broker>,
    http: reqwest::Client,
    http_config: HttpConfig,
    mq_config: MqConfig,
}

impl Transports {
    pub fn new(config: &SaltlineConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            http: reqwest::Client::new(),
            http_config: config.http.clone(),
            mq_config: config.mq.clone(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

impl TransportFactory for Transports {
    fn req_client(&self, opts: &ChannelOptions) -> Result<Arc<dyn ReqClientTransport>, TransportError> {
        let transport: Arc<dyn ReqClientTransport> = match opts.transport {
            TransportKind::Tcp => Arc::new(tcp::TcpReqClient::new(&opts.master_uri)),
            TransportKind::Http => Arc::new(http::HttpReqClient::new(self.http.clone(), &opts.master_uri)),
            TransportKind::Mq => Arc::new(mq::MqReqClient::new(
                self.broker.clone(),
                &self.mq_config,
                &opts.node_id,
            )?),
        };
        Ok(transport)
    }

    fn pub_client(&self, opts: &ChannelOptions) -> Result<Arc<dyn PubClientTransport>, TransportError> {
        let transport: Arc<dyn PubClientTransport> = match opts.transport {
            TransportKind::Tcp => Arc::new(tcp::TcpPubClient::new(&opts.publish_uri)),
            TransportKind::Http => Arc::new(http::HttpPubClient::new(
                self.http.clone(),
                &opts.publish_uri,
                &self.http_config,
            )),
            TransportKind::Mq => Arc::new(mq::MqPubClient::new(self.broker.clone(), &self.mq_config)),
        };
        Ok(transport)
    }
}

// ── Master side ───────────────────────────────────────────────────────────────

enum PubAcceptor {
    Tcp(Arc<tcp::TcpPubServer>),
    Http(Arc<http::HttpPubServer>),
    None,
}

/// Bound server halves for a master.
pub struct MasterTransports {
    pub req: Arc<dyn ReqServerTransport>,
    pub publish: Arc<dyn PubServerTransport>,
    /// Listening addresses, for socket backends.
    pub req_addr: Option<SocketAddr>,
    pub publish_addr: Option<SocketAddr>,
    acceptor: PubAcceptor,
}

impl MasterTransports {
    /// Bind (or for the broker, create queues and topics for) the backend
    /// named in `config.channel.transport`.
    pub async fn bind(config: &SaltlineConfig, broker: Arc<dyn Broker>) -> Result<Self, TransportError> {
        let master = &config.master;
        Ok(match config.channel.transport {
            TransportKind::Tcp => {
                let req = Arc::new(tcp::TcpReqServer::bind(&master.req_uri).await?);
                let publish = Arc::new(tcp::TcpPubServer::bind(&master.publish_uri).await?);
                Self {
                    req_addr: Some(req.local_addr()),
                    publish_addr: Some(publish.local_addr()),
                    req,
                    publish: publish.clone(),
                    acceptor: PubAcceptor::Tcp(publish),
                }
            }
            TransportKind::Http => {
                let req = Arc::new(http::HttpReqServer::bind(&master.req_uri).await?);
                let publish = Arc::new(http::HttpPubServer::bind(&master.publish_uri, &config.http).await?);
                Self {
                    req_addr: Some(req.local_addr()),
                    publish_addr: Some(publish.local_addr()),
                    req,
                    publish: publish.clone(),
                    acceptor: PubAcceptor::Http(publish),
                }
            }
            TransportKind::Mq => Self {
                req: Arc::new(mq::MqReqServer::bind(broker.clone(), &config.mq).await?),
                publish: Arc::new(mq::MqPubServer::bind(broker, &config.mq).await?),
                req_addr: None,
                publish_addr: None,
                acceptor: PubAcceptor::None,
            },
        })
    }

    /// Start serving requests, accepting subscribers and draining publishes.
    pub fn spawn(
        self,
        channel: Arc<ReqServerChannel>,
        daemon: PublishDaemon,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<Result<(), TransportError>>> {
        let mut tasks = vec![
            tokio::spawn(self.req.serve(channel, shutdown.subscribe())),
            tokio::spawn(daemon.run(self.publish, shutdown.subscribe())),
        ];
        match self.acceptor {
            PubAcceptor::Tcp(server) => tasks.push(tokio::spawn(server.run(shutdown.subscribe()))),
            PubAcceptor::Http(server) => tasks.push(tokio::spawn(server.run(shutdown.subscribe()))),
            PubAcceptor::None => {}
        }
        tasks
    }
}
