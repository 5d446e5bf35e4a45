use anyhow::Result;
use serde_json::json;

use saltline_core::config::{Crypt, TransportKind};

use crate::*;

/// A list-targeted job reaches the listed minions and nobody else.
async fn list_target_reaches_only_listed(transport: TransportKind) -> Result<()> {
    let cluster = Cluster::start(transport).await?;
    let (_web, mut web_rx) = cluster.subscribe("web-01").await?;
    let (_db, mut db_rx) = cluster.subscribe("db-01").await?;
    let (_cache, mut cache_rx) = cluster.subscribe("cache-01").await?;

    let admin = cluster.channel("admin", Crypt::Aes)?;
    let reply = admin
        .send(load(json!({
            "cmd": "publish",
            "id": "admin",
            "fun": "test.ping",
            "tgt": ["web-01", "db-01"],
            "tgt_type": "list",
        })))
        .await?;
    let serial = reply.as_ref().and_then(|r| r["serial"].as_u64());
    assert!(serial.is_some(), "no serial in {reply:?}");

    for rx in [&mut web_rx, &mut db_rx] {
        let job = next_publish(rx).await?;
        assert_eq!(job["fun"], "test.ping");
        assert_eq!(job["serial"].as_u64(), serial);
    }
    assert!(stays_quiet(&mut cache_rx).await, "cache-01 was not targeted");
    Ok(())
}

#[tokio::test]
async fn test_list_publish_over_tcp() -> Result<()> {
    list_target_reaches_only_listed(TransportKind::Tcp).await
}

#[tokio::test]
async fn test_list_publish_over_http() -> Result<()> {
    list_target_reaches_only_listed(TransportKind::Http).await
}

#[tokio::test]
async fn test_list_publish_over_mq() -> Result<()> {
    list_target_reaches_only_listed(TransportKind::Mq).await
}

#[tokio::test]
async fn test_glob_publish_reaches_everyone() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Tcp).await?;
    let (_web, mut web_rx) = cluster.subscribe("web-01").await?;
    let (_db, mut db_rx) = cluster.subscribe("db-01").await?;

    cluster.master.publisher.publish(load(json!({
        "fun": "state.apply",
        "tgt": "*",
        "tgt_type": "glob",
    })))?;

    assert_eq!(next_publish(&mut web_rx).await?["fun"], "state.apply");
    assert_eq!(next_publish(&mut db_rx).await?["fun"], "state.apply");
    Ok(())
}

#[tokio::test]
async fn test_publishes_arrive_in_order() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Http).await?;
    let (_web, mut rx) = cluster.subscribe("web-01").await?;

    for n in 0..5 {
        cluster.master.publisher.publish(load(json!({"fun": "test.echo", "arg": [n]})))?;
    }
    let mut last = 0;
    for n in 0..5 {
        let job = next_publish(&mut rx).await?;
        assert_eq!(job["arg"][0], n);
        let serial = job["serial"].as_u64().unwrap_or_default();
        assert!(serial > last, "serials must increase");
        last = serial;
    }
    Ok(())
}

#[tokio::test]
async fn test_unsigned_master_still_delivers() -> Result<()> {
    let cluster = Cluster::start_with(TransportKind::Tcp, |c| c.publish.sign_pub_messages = false).await?;
    let (_web, mut rx) = cluster.subscribe("web-01").await?;

    cluster.master.publisher.publish(load(json!({"fun": "test.ping"})))?;
    assert_eq!(next_publish(&mut rx).await?["fun"], "test.ping");
    Ok(())
}
