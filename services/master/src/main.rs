//! stevedore master
//!
//! Runs the per-pool leader: watches service documents in the coordination
//! store and reconciles declared instance counts against running containers
//! across the fleet. Assumes the leadership lock for its pool is already
//! held.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stevedore_master::config::Config;
use stevedore_master::{EntityStore, Facade, Leader};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stevedore master");

    let config = Config::from_env()?;
    info!(pool_id = %config.pool_id, "Configuration loaded");

    let client = stevedore_coord::Client::new(stevedore_coord::Config::default());
    let conn = client.connect()?;

    let store = EntityStore::new();
    let facade = Arc::new(Facade::new(store, conn.clone()));
    facade.create_default_pool()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let leader = Leader::new(conn, facade, config.pool_id);
    leader.lead(shutdown_rx).await;

    Ok(())
}
