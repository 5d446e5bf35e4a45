//! Error types for channels and the transports beneath them.

use saltline_core::crypto::CryptoError;
use saltline_core::payload::PayloadError;
use saltline_core::wire::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("http error: {0}")]
    Http(String),
    #[error("queue {0} does not exist")]
    QueueDoesNotExist(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("invalid transport configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Errors that mean the peer went away, as opposed to a misconfigured
    /// backend that retrying can never fix.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Closed
                | TransportError::NotConnected
                | TransportError::Connect { .. }
                | TransportError::Io(_)
                | TransportError::Http(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("master rejected our key")]
    Rejected,
    #[error("our key is pending acceptance on the master")]
    Pending,
    #[error("master has reached its minion limit")]
    Full,
    #[error("malformed auth reply: {0}")]
    Malformed(String),
    #[error("reply could not be decrypted with the session key: {0}")]
    Decrypt(CryptoError),
    #[error("master could not decrypt our request")]
    BadLoad,
    #[error("channel has no auth session (crypt = clear)")]
    NoAuth,
    #[error("key material: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection to master lost")]
    ConnectionLost,
    #[error("request timed out after {tries} attempts")]
    Timeout { tries: u32 },
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("channel is closed")]
    Closed,
    #[error("publish queue is full")]
    QueueFull,
    #[error("master replied with an error: {0}")]
    Server(String),
    #[error("malformed reply: {0}")]
    BadReply(String),
    #[error("{0}")]
    Client(String),
}

impl ChannelError {
    /// Failures a fresh auth session may cure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ChannelError::Auth(AuthError::Decrypt(_)) | ChannelError::Auth(AuthError::BadLoad)
        )
    }

    /// Failures worth retrying while connecting a publish channel.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::ConnectionLost
                | ChannelError::Timeout { .. }
                | ChannelError::Auth(AuthError::Pending)
        )
    }
}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        if e.is_disconnect() {
            ChannelError::ConnectionLost
        } else {
            ChannelError::Transport(e)
        }
    }
}

impl From<WireError> for ChannelError {
    fn from(e: WireError) -> Self {
        ChannelError::BadReply(e.to_string())
    }
}

impl From<PayloadError> for ChannelError {
    fn from(e: PayloadError) -> Self {
        ChannelError::BadReply(e.to_string())
    }
}
