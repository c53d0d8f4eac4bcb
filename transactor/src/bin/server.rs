//! Transactor server binary
//!
//! Usage: `transactor-server [config.toml]`. Without a path the
//! configuration is read from `TRANSACTOR_*` environment variables.

use anyhow::Context;
use std::sync::Arc;
use transactor::{Config, Transactor, TransactorService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => Config::from_env().context("failed to load config from environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        data_dir = %config.data_dir.display(),
        "Starting transactor server"
    );

    let transactor = Arc::new(
        Transactor::open(config)
            .await
            .context("failed to open transactor")?,
    );
    let _service = TransactorService::new(transactor.clone());
    tracing::info!(
        cached_accounts = transactor.cache().len(),
        "Transactor ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down transactor server");
    transactor.close().await;

    let metrics = transactor.metrics();
    tracing::info!(
        transfers = metrics.transfers_total.get(),
        failures = metrics.transfer_failures.get(),
        queue_full = metrics.queue_full.get(),
        events_dropped = metrics.events_dropped.get(),
        cache_hit_rate = transactor.cache().stats().hit_rate(),
        "Final counters"
    );
    Ok(())
}
