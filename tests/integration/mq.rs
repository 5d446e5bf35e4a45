use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use saltline_channel::error::{ChannelError, TransportError};
use saltline_channel::req_client::ChannelRegistry;
use saltline_channel::transport::TransportFactory;
use saltline_core::config::{Crypt, TransportKind};
use saltline_transport::mq::{queue_name, reply_queue_name};
use saltline_transport::Transports;

use crate::*;

#[tokio::test]
async fn test_replies_come_back_on_the_minion_reply_queue() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Mq).await?;
    let channel = cluster.channel("web-01", Crypt::Aes)?;

    let reply = channel.send(load(json!({"cmd": "ping", "id": "web-01"}))).await?;
    assert_eq!(reply, Some(json!({"cmd": "pong"})));

    let master_queue = queue_name(&cluster.minion_base.mq.master_queue_name);
    let reply_queue = reply_queue_name(&cluster.minion_base.mq.consumer_queue_for("web-01"))?;
    assert_eq!(reply_queue, "saltline_web_01_reply");
    // everything consumed has been deleted
    assert_eq!(cluster.broker.depth(&master_queue), 0);
    assert_eq!(cluster.broker.depth(&reply_queue), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_master_queue_is_not_masked() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Mq).await?;

    let mut config = cluster.minion_base.clone();
    config.mq.master_queue_name = "nowhere".into();
    let factory: Arc<dyn TransportFactory> = Arc::new(Transports::new(&config, cluster.broker.clone()));
    let registry = ChannelRegistry::new(factory);
    let mut opts = cluster.minion("web-01", Crypt::Clear);
    opts.tries = 1;
    let channel = registry.obtain(&opts)?;

    let err = channel
        .send(load(json!({"cmd": "ping", "id": "web-01"})))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ChannelError::Transport(TransportError::QueueDoesNotExist(ref q)) if q == "nowhere"),
        "{err}"
    );
    Ok(())
}

#[tokio::test]
async fn test_two_minions_share_one_broker() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Mq).await?;
    let web = cluster.channel("web-01", Crypt::Aes)?;
    let db = cluster.channel("db-01", Crypt::Aes)?;

    let (a, b) = tokio::join!(
        web.send(load(json!({"cmd": "echo", "id": "web-01"}))),
        db.send(load(json!({"cmd": "echo", "id": "db-01"}))),
    );
    assert_eq!(a?.map(|r| r["id"].clone()), Some(json!("web-01")));
    assert_eq!(b?.map(|r| r["id"].clone()), Some(json!("db-01")));
    assert_eq!(cluster.master.keys.auth_requests(), 2);
    Ok(())
}
