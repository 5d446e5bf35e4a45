//! Commands the master answers on its request channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use saltline_channel::pub_server::PubServerChannel;
use saltline_channel::req_server::{HandlerError, ReplyMode, RequestHandler};
use saltline_core::payload::{Enc, Load};

/// Keys a publish request may carry through to subscribers.
const PUBLISH_KEYS: [&str; 5] = ["fun", "arg", "tgt", "tgt_type", "jid"];

/// Commands only an authenticated node may run.
const PRIVILEGED: [&str; 3] = ["publish", "_return", "_pillar"];

pub struct MasterHandler {
    publisher: Arc<PubServerChannel>,
}

impl MasterHandler {
    pub fn new(publisher: Arc<PubServerChannel>) -> Self {
        Self { publisher }
    }

    fn publish(&self, load: &Load) -> Result<Value, HandlerError> {
        if !load.contains_key("fun") {
            return Err(HandlerError::Failed("publish needs a fun".into()));
        }
        let mut job = Load::new();
        for key in PUBLISH_KEYS {
            if let Some(value) = load.get(key) {
                job.insert(key.to_string(), value.clone());
            }
        }
        let serial = self
            .publisher
            .publish(job)
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        Ok(json!({"published": true, "serial": serial}))
    }
}

fn node_id(load: &Load) -> Result<&str, HandlerError> {
    load.get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::Failed("request carries no id".into()))
}

#[async_trait]
impl RequestHandler for MasterHandler {
    async fn handle(&self, enc: Enc, load: Load) -> Result<(Value, ReplyMode), HandlerError> {
        let cmd = load.get("cmd").and_then(Value::as_str).unwrap_or_default();
        tracing::debug!(cmd, id = ?load.get("id"), ?enc, "request");
        if enc == Enc::Clear && PRIVILEGED.contains(&cmd) {
            return Err(HandlerError::Unauthenticated(cmd.to_string()));
        }
        // a clear requester holds no session key
        let plain = match enc {
            Enc::Clear => ReplyMode::Clear,
            Enc::Aes => ReplyMode::Standard,
        };
        match cmd {
            "ping" => Ok((json!({"cmd": "pong"}), plain)),
            "echo" => Ok((Value::Object(load), plain)),
            "publish" => Ok((self.publish(&load)?, ReplyMode::Standard)),
            "_return" => {
                tracing::info!(
                    id = ?load.get("id"),
                    jid = ?load.get("jid"),
                    ret = ?load.get("return"),
                    "job return"
                );
                Ok((Value::Bool(true), ReplyMode::Standard))
            }
            "_pillar" => {
                let id = node_id(&load)?.to_string();
                let data = json!({"id": id, "saltline": {"master": true}});
                Ok((
                    data,
                    ReplyMode::Private {
                        dictkey: "pillar".into(),
                        target: id,
                    },
                ))
            }
            other => Err(HandlerError::Failed(format!("unknown command {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saltline_channel::keys::KeyAuthority;
    use saltline_channel::pub_server::PublishOptions;
    use saltline_core::config::{AuthConfig, Crypt};

    fn handler(name: &str) -> (MasterHandler, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("saltlined-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let keys = Arc::new(KeyAuthority::new(&dir, AuthConfig::default(), false).unwrap());
        let (publisher, _daemon) = PubServerChannel::new(
            keys,
            PublishOptions {
                crypt: Crypt::Clear,
                order_masters: false,
            },
        );
        (MasterHandler::new(Arc::new(publisher)), dir)
    }

    fn load(value: Value) -> Load {
        match value {
            Value::Object(map) => map,
            _ => Load::new(),
        }
    }

    #[tokio::test]
    async fn answers_known_commands() {
        let (h, dir) = handler("commands");
        let (reply, mode) = h.handle(Enc::Aes, load(json!({"cmd": "ping"}))).await.unwrap();
        assert_eq!(reply, json!({"cmd": "pong"}));
        assert_eq!(mode, ReplyMode::Standard);

        let (_, mode) = h
            .handle(Enc::Aes, load(json!({"cmd": "_pillar", "id": "web-01"})))
            .await
            .unwrap();
        assert_eq!(
            mode,
            ReplyMode::Private {
                dictkey: "pillar".into(),
                target: "web-01".into()
            }
        );

        assert!(h.handle(Enc::Aes, load(json!({"cmd": "_pillar"}))).await.is_err());
        assert!(h.handle(Enc::Aes, load(json!({"cmd": "reboot"}))).await.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn publish_requires_fun() {
        let (h, dir) = handler("publish");
        assert!(h.handle(Enc::Aes, load(json!({"cmd": "publish"}))).await.is_err());
        // the daemon half is gone, so queueing fails and surfaces as a handler error
        assert!(h
            .handle(Enc::Aes, load(json!({"cmd": "publish", "fun": "test.ping"})))
            .await
            .is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn clear_requests_get_clear_replies_and_no_privileges() {
        let (h, dir) = handler("clear");
        let (reply, mode) = h.handle(Enc::Clear, load(json!({"cmd": "ping"}))).await.unwrap();
        assert_eq!(reply, json!({"cmd": "pong"}));
        assert_eq!(mode, ReplyMode::Clear);

        for cmd in PRIVILEGED {
            let err = h
                .handle(Enc::Clear, load(json!({"cmd": cmd, "id": "evil", "fun": "cmd.run"})))
                .await
                .unwrap_err();
            assert!(matches!(err, HandlerError::Unauthenticated(ref c) if c == cmd), "{err}");
        }
        let _ = std::fs::remove_dir_all(dir);
    }
}
