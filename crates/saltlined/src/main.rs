//! saltlined — saltline master daemon.

use std::sync::Arc;

use anyhow::Result;

use saltline_core::config::SaltlineConfig;
use saltline_transport::InMemoryBroker;
use saltlined::Master;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SaltlineConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SaltlineConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SaltlineConfig::default()
    });
    tracing::info!(node = %config.identity.node_id, "saltlined starting");

    let master = Master::start(&config, Arc::new(InMemoryBroker::new())).await?;
    if config.auth.open_mode {
        tracing::warn!("open mode enabled, every presented key is accepted");
    }

    {
        let shutdown = master.shutdown_handle();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    master.wait().await?;
    tracing::info!("saltlined stopped");
    Ok(())
}
