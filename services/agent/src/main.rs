//! stevedore agent
//!
//! Runs on every host in the fleet. Registers liveness with the
//! coordination store and converges local containers to the instance
//! commands addressed to this host.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stevedore_agent::agent::HostAgent;
use stevedore_agent::config::Config;
use stevedore_agent::docker::DockerEngine;
use stevedore_agent::vip::SysIpManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stevedore agent");

    let config = Config::from_env()?;
    info!(
        pool_id = %config.pool_id,
        docker_endpoint = %config.docker_endpoint,
        "Configuration loaded"
    );

    let engine = Arc::new(DockerEngine::connect(&config.docker_endpoint)?);
    let client = stevedore_coord::Client::new(stevedore_coord::Config::default());
    let agent = HostAgent::new(client, config, engine, Arc::new(SysIpManager))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    agent.run(shutdown_rx).await;
    Ok(())
}
