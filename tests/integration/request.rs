use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use saltline_channel::error::{AuthError, ChannelError};
use saltline_channel::keys::KeyState;
use saltline_channel::message_client::MessageClient;
use saltline_channel::req_server::{BAD_LOAD, HANDLER_EXCEPTION, ID_NULL_BYTE, NOT_A_DICT};
use saltline_channel::transport::ReqClientTransport;
use saltline_core::config::{Crypt, TransportKind};
use saltline_transport::tcp::TcpReqClient;

use crate::*;

/// A fresh aes channel authenticates once, then every request reuses the session.
async fn ping_authenticates_once(transport: TransportKind) -> Result<()> {
    let cluster = Cluster::start(transport).await?;
    let channel = cluster.channel("web-01", Crypt::Aes)?;

    for _ in 0..3 {
        let reply = channel.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
        assert_eq!(reply, Some(json!({"cmd": "pong"})));
    }
    assert_eq!(cluster.master.keys.auth_requests(), 1);
    channel.close();
    Ok(())
}

#[tokio::test]
async fn test_ping_over_tcp() -> Result<()> {
    ping_authenticates_once(TransportKind::Tcp).await
}

#[tokio::test]
async fn test_ping_over_http() -> Result<()> {
    ping_authenticates_once(TransportKind::Http).await
}

#[tokio::test]
async fn test_ping_over_mq() -> Result<()> {
    ping_authenticates_once(TransportKind::Mq).await
}

#[tokio::test]
async fn test_clear_channel_skips_auth() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let channel = cluster.channel("web-01", Crypt::Clear)?;

    let reply = channel
        .send(load(json!({"cmd": "echo", "id": "web-01", "n": 7})))
        .await?
        .context("empty echo")?;
    assert_eq!(reply["n"], 7);
    assert_eq!(reply["id"], "web-01");
    assert_eq!(cluster.master.keys.auth_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_clear_channel_cannot_publish() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let (_web, mut web_rx) = cluster.subscribe("web-01").await?;
    let intruder = cluster.channel("intruder", Crypt::Clear)?;
    let auths = cluster.master.keys.auth_requests();

    let err = intruder
        .send(load(json!({
            "cmd": "publish",
            "id": "intruder",
            "fun": "cmd.run",
            "arg": ["rm -rf /"],
            "tgt": "*",
        })))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Server(ref s) if s == HANDLER_EXCEPTION), "{err}");
    assert!(stays_quiet(&mut web_rx).await, "clear publish reached a minion");
    assert_eq!(cluster.master.keys.auth_requests(), auths);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let channel = Arc::new(cluster.channel("web-01", Crypt::Aes)?);

    let mut tasks = Vec::new();
    for n in 0..16 {
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            channel
                .send(load(json!({"cmd": "echo", "id": "web-01", "n": n})))
                .await
                .map(|reply| (n, reply))
        }));
    }
    for task in tasks {
        let (n, reply) = task.await??;
        let reply = reply.context("empty echo")?;
        assert_eq!(reply["n"], n);
    }
    assert_eq!(cluster.master.keys.auth_requests(), 1);
    Ok(())
}

#[tokio::test]
async fn test_channels_are_shared_per_identity() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let a = cluster.channel("web-01", Crypt::Aes)?;
    let b = cluster.channel("web-01", Crypt::Aes)?;
    let other = cluster.channel("db-01", Crypt::Aes)?;

    assert!(a.same_channel(&b));
    assert!(!a.same_channel(&other));
    assert_eq!(cluster.registry.ref_count(a.key()), 2);

    a.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
    b.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
    assert_eq!(cluster.master.keys.auth_requests(), 1);

    let key = a.key().clone();
    drop(a);
    assert_eq!(cluster.registry.ref_count(&key), 1);
    drop(b);
    assert_eq!(cluster.registry.ref_count(&key), 0);
    Ok(())
}

#[tokio::test]
async fn test_private_pillar_reply() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Http).await?;
    let channel = cluster.channel("web-01", Crypt::Aes)?;

    let pillar = channel
        .crypted_transfer_decode_dictentry(load(json!({"cmd": "_pillar", "id": "web-01"})), "pillar")
        .await?;
    assert_eq!(pillar["id"], "web-01");
    Ok(())
}

#[tokio::test]
async fn test_handler_failure_is_reported() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let channel = cluster.channel("web-01", Crypt::Aes)?;

    let err = channel
        .send(load(json!({"cmd": "no.such.command", "id": "web-01"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Server(ref s) if s == HANDLER_EXCEPTION), "{err}");

    // the channel keeps working afterwards
    let reply = channel.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
    assert_eq!(reply, Some(json!({"cmd": "pong"})));
    Ok(())
}

#[tokio::test]
async fn test_session_rotation_reauthenticates() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let channel = cluster.channel("web-01", Crypt::Aes)?;

    channel.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
    cluster.master.keys.rotate_session_key();
    let reply = channel.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
    assert_eq!(reply, Some(json!({"cmd": "pong"})));
    assert_eq!(cluster.master.keys.auth_requests(), 2);
    Ok(())
}

#[tokio::test]
async fn test_pending_key_is_not_served() -> Result<()> {
    let cluster = Cluster::start_with(TransportKind::Tcp, |c| c.auth.auto_accept = false).await?;
    let channel = cluster.channel("web-01", Crypt::Aes)?;

    let err = channel
        .send(load(json!({"cmd": "ping", "id": "web-01"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Auth(AuthError::Pending)), "{err}");
    assert_eq!(cluster.master.keys.list(KeyState::Pending), ["web-01"]);

    cluster.master.keys.accept("web-01")?;
    let reply = channel.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
    assert_eq!(reply, Some(json!({"cmd": "pong"})));
    Ok(())
}

/// Malformed payloads get a literal reply and the connection keeps serving.
#[tokio::test]
async fn test_malformed_requests_do_not_stop_the_server() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let transport: Arc<dyn ReqClientTransport> = Arc::new(TcpReqClient::new(&cluster.minion_base.master.req_uri));
    let client = MessageClient::new(transport);
    client.connect().await?;

    let timeout = Duration::from_secs(5);
    let reply = client.send(&json!("not a payload"), 1, timeout).await?;
    assert_eq!(reply.body, json!(BAD_LOAD));

    let reply = client
        .send(&json!({"enc": "clear", "load": ["cmd", "ping"]}), 1, timeout)
        .await?;
    assert_eq!(reply.body, json!(NOT_A_DICT));

    let reply = client
        .send(&json!({"enc": "clear", "load": {"cmd": "ping", "id": "web\u{0}01"}}), 1, timeout)
        .await?;
    assert_eq!(reply.body, json!(ID_NULL_BYTE));

    let reply = client
        .send(&json!({"enc": "clear", "load": {"cmd": "ping", "id": "web-01"}}), 1, timeout)
        .await?;
    assert!(reply.body.is_object(), "unexpected reply {}", reply.body);

    client.close();
    Ok(())
}
