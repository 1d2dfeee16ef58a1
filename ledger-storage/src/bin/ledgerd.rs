//! Ledger storage daemon
//!
//! Opens every registered ledger, projects pending logs and keeps the write
//! workers running until interrupted.

use anyhow::Context;
use ledger_storage::{Config, Driver, Exclusive, Metrics, Shared, WriterMode};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var_os("LEDGER_LOG_JSON").is_some() {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    let config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("failed to load config from {}", path))?;
            config.apply_env()?;
            config.validate()?;
            config
        }
        Err(_) => Config::from_env()?,
    };
    Ok(config)
}

async fn run<M: WriterMode>(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let driver = Driver::<M>::connect(config, metrics)
        .await
        .context("failed to connect to database")?;
    driver
        .initialize()
        .await
        .context("failed to initialize system catalog")?;

    let stores = driver.open_all().await?;
    tracing::info!(ledgers = stores.len(), "Ledgers opened");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger storage");
    driver.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config()?;
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        single_writer = config.store.single_writer,
        "Starting ledger storage"
    );

    if config.store.single_writer {
        run::<Exclusive>(config).await
    } else {
        run::<Shared>(config).await
    }
}
