//! saltline-channel — request and publish channels between a master and its
//! minions. Channels own auth, encryption, correlation and retries; the
//! frames themselves move over a transport from `saltline-transport`.

pub mod auth;
pub mod error;
pub mod keys;
pub mod message_client;
pub mod pub_client;
pub mod pub_server;
pub mod req_client;
pub mod req_server;
pub mod transport;

pub use auth::{AsyncAuth, AuthSession};
pub use error::{AuthError, ChannelError, TransportError};
pub use keys::{KeyAuthority, KeyState};
pub use pub_client::{AsyncPubChannel, ConnectRetry, PubCallback};
pub use pub_server::{PubServerChannel, PublishDaemon, PublishOptions};
pub use req_client::{AsyncReqChannel, ChannelKey, ChannelOptions, ChannelRegistry};
pub use req_server::{HandlerError, ReplyMode, ReqServerChannel, RequestHandler, ServerReply};
pub use transport::{
    PubClientTransport, PubServerTransport, ReplyEvent, ReqClientTransport, ReqServerTransport,
    TransportFactory,
};
