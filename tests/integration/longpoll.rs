use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;

use saltline_core::config::TransportKind;
use saltline_transport::http::UpdatesResponse;

use crate::*;

async fn updates(client: &reqwest::Client, url: &str, form: &[(&str, &str)]) -> Result<UpdatesResponse> {
    client
        .post(url)
        .form(form)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?
        .json::<UpdatesResponse>()
        .await
        .context("failed to parse updates response")
}

#[tokio::test]
async fn test_buffer_keeps_only_newest_messages() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Http).await?;
    let addr = cluster.master.publish_addr.context("http master has no publish address")?;
    let url = format!("http://{addr}/message/updates");
    let client = reqwest::Client::new();

    for n in 0..250 {
        cluster.master.publisher.publish(load(json!({"fun": "test.echo", "arg": [n]})))?;
    }

    // the publish daemon drains asynchronously; wait for the head to settle
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let head = updates(&client, &url, &[]).await?;
        if head.cursor == "250" {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            bail!("buffer head stuck at {}", head.cursor);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let all = updates(&client, &url, &[("cursor", "0")]).await?;
    assert_eq!(all.messages.len(), 200);
    assert_eq!(all.cursor, "250");

    let tail = updates(&client, &url, &[("cursor", "240")]).await?;
    assert_eq!(tail.messages.len(), 10);
    assert_eq!(tail.messages.last(), all.messages.last());
    Ok(())
}

#[tokio::test]
async fn test_long_poll_returns_empty_after_timeout() -> Result<()> {
    let cluster = Cluster::start_with(TransportKind::Http, |c| c.http.long_poll_timeout_secs = 1).await?;
    let addr = cluster.master.publish_addr.context("http master has no publish address")?;
    let url = format!("http://{addr}/message/updates");
    let client = reqwest::Client::new();

    let head = updates(&client, &url, &[]).await?;
    let started = tokio::time::Instant::now();
    let polled = updates(&client, &url, &[("cursor", head.cursor.as_str()), ("id", "web-01")]).await?;
    assert!(polled.messages.is_empty());
    assert_eq!(polled.cursor, head.cursor);
    assert!(started.elapsed() >= Duration::from_millis(900));
    Ok(())
}

#[tokio::test]
async fn test_long_poll_wakes_on_publish() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Http).await?;
    let addr = cluster.master.publish_addr.context("http master has no publish address")?;
    let url = format!("http://{addr}/message/updates");
    let client = reqwest::Client::new();

    let head = updates(&client, &url, &[]).await?;
    let poll = {
        let client = client.clone();
        let url = url.clone();
        let cursor = head.cursor.clone();
        tokio::spawn(async move { updates(&client, &url, &[("cursor", cursor.as_str())]).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.master.publisher.publish(load(json!({"fun": "test.ping"})))?;

    let got = tokio::time::timeout(WAIT, poll).await???;
    assert_eq!(got.messages.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_bad_cursor_is_rejected() -> Result<()> {
    let cluster = Cluster::start(TransportKind::Http).await?;
    let addr = cluster.master.publish_addr.context("http master has no publish address")?;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/message/updates"))
        .form(&[("cursor", "soon")])
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    Ok(())
}
