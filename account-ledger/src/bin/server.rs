//! Ledger server binary
//!
//! Usage: `ledger-server [config.toml]`. Without a path, configuration comes
//! from `LEDGER_*` environment variables.

use account_ledger::{Config, Ledger};
use anyhow::Context;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => Config::from_env().context("failed to load config from environment")?,
    };

    init_tracing(&config)?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        data_dir = ?config.data_dir,
        "Starting ledger server"
    );

    let ledger = Ledger::open(config.clone())
        .await
        .context("failed to open ledger")?;

    // Keep resolving transfers orphaned by crashed writers
    let engine = ledger.engine().clone();
    let grace = Duration::from_millis(config.recovery.orphan_grace_ms);
    let recovery = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(grace.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = engine.recover_orphaned_transfers(grace).await {
                tracing::error!(error = %e, "Recovery pass failed");
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down ledger server");
    recovery.abort();
    let _ = recovery.await;

    tracing::debug!(metrics = %ledger.metrics().render()?, "Final metrics");
    ledger.shutdown().await?;
    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
