//! Configuration system for saltline.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SALTLINE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/saltline/config.toml
//!   3. ~/.config/saltline/config.toml
//!
//! Environment overrides use `SALTLINE_<SECTION>__<KEY>`, e.g.
//! `SALTLINE_CHANNEL__TRANSPORT=http`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaltlineConfig {
    pub identity: IdentityConfig,
    pub master: MasterConfig,
    pub channel: ChannelConfig,
    pub auth: AuthConfig,
    pub publish: PublishConfig,
    pub http: HttpConfig,
    pub mq: MqConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Minion id. Also names this node's MQ consumer queue.
    pub node_id: String,
    /// Key directory. Holds this node's keys and, on a master, the
    /// minions / minions_pre / minions_rejected / minions_denied stores.
    pub pki_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Request endpoint, `host:port`.
    pub req_uri: String,
    /// Publish endpoint, `host:port`. Unused by the mq backend.
    pub publish_uri: String,
}

/// Whether request payloads are encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crypt {
    Aes,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Http,
    Mq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub crypt: Crypt,
    pub transport: TransportKind,
    /// Attempts per request before giving up.
    pub tries: u32,
    /// Per-attempt reply timeout.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept every key, replacing stored keys on mismatch.
    pub open_mode: bool,
    /// Accept new minion keys without an operator.
    pub auto_accept: bool,
    /// Cap on accepted minions. 0 = unlimited.
    pub max_minions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub sign_pub_messages: bool,
    /// This master relays for lower masters (syndic); never attach topic lists.
    pub order_masters: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Messages retained for long-poll clients.
    pub buffer_capacity: usize,
    pub long_poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    /// Queue the master consumes requests from.
    pub master_queue_name: String,
    /// Queue this node consumes from. Empty = derived from the node id.
    pub consumer_queue_name: String,
    /// Topic publishes fan out through.
    pub publisher_topic: String,
    pub region: String,
    pub batch_size: usize,
    pub wait_time_secs: u64,
    pub poll_sleep_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "minion".to_string()),
            pki_dir: config_dir().join("pki"),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            req_uri: "127.0.0.1:4506".to_string(),
            publish_uri: "127.0.0.1:4505".to_string(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            crypt: Crypt::Aes,
            transport: TransportKind::Tcp,
            tries: 3,
            timeout_secs: 60,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            open_mode: false,
            auto_accept: false,
            max_minions: 0,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            sign_pub_messages: true,
            order_masters: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 200,
            long_poll_timeout_secs: 30,
        }
    }
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            master_queue_name: "saltline-master".to_string(),
            consumer_queue_name: String::new(),
            publisher_topic: "saltline-publish".to_string(),
            region: "local".to_string(),
            batch_size: 10,
            wait_time_secs: 20,
            poll_sleep_ms: 500,
        }
    }
}

impl ChannelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HttpConfig {
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_timeout_secs)
    }
}

impl MqConfig {
    /// Consumer queue for `node_id`, honouring an explicit override.
    pub fn consumer_queue_for(&self, node_id: &str) -> String {
        if self.consumer_queue_name.is_empty() {
            format!("saltline-{node_id}")
        } else {
            self.consumer_queue_name.clone()
        }
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn poll_sleep(&self) -> Duration {
        Duration::from_millis(self.poll_sleep_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("saltline")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SaltlineConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is missing.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            SaltlineConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("SALTLINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SaltlineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SALTLINE_* overrides read through `lookup`. Unparseable values
    /// are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("SALTLINE_IDENTITY__NODE_ID") {
            self.identity.node_id = v;
        }
        if let Some(v) = lookup("SALTLINE_IDENTITY__PKI_DIR") {
            self.identity.pki_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SALTLINE_MASTER__REQ_URI") {
            self.master.req_uri = v;
        }
        if let Some(v) = lookup("SALTLINE_MASTER__PUBLISH_URI") {
            self.master.publish_uri = v;
        }
        if let Some(v) = lookup("SALTLINE_CHANNEL__CRYPT") {
            match v.as_str() {
                "aes" => self.channel.crypt = Crypt::Aes,
                "clear" => self.channel.crypt = Crypt::Clear,
                _ => {}
            }
        }
        if let Some(v) = lookup("SALTLINE_CHANNEL__TRANSPORT") {
            match v.as_str() {
                "tcp" => self.channel.transport = TransportKind::Tcp,
                "http" => self.channel.transport = TransportKind::Http,
                "mq" => self.channel.transport = TransportKind::Mq,
                _ => {}
            }
        }
        if let Some(n) = lookup("SALTLINE_CHANNEL__TRIES").and_then(|v| v.parse().ok()) {
            self.channel.tries = n;
        }
        if let Some(n) = lookup("SALTLINE_CHANNEL__TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.channel.timeout_secs = n;
        }
        if let Some(v) = lookup("SALTLINE_AUTH__OPEN_MODE") {
            self.auth.open_mode = flag(v);
        }
        if let Some(v) = lookup("SALTLINE_AUTH__AUTO_ACCEPT") {
            self.auth.auto_accept = flag(v);
        }
        if let Some(v) = lookup("SALTLINE_PUBLISH__SIGN_PUB_MESSAGES") {
            self.publish.sign_pub_messages = flag(v);
        }
        if let Some(v) = lookup("SALTLINE_PUBLISH__ORDER_MASTERS") {
            self.publish.order_masters = flag(v);
        }
        if let Some(v) = lookup("SALTLINE_MQ__REGION") {
            self.mq.region = v;
        }
    }
}
