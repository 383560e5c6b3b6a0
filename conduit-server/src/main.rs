//! # conduitd
//!
//! Hosts the Conduit operation engine: loads and validates the engine
//! configuration, starts the scheduler, maintainer and cascade processor,
//! and runs until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use conduit_config::{ConfigLoad, ConfigLoader};
use conduit_core::{Engine, OperationEventPayload};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "conduitd")]
#[command(about = "Asynchronous operation engine for the Conduit control plane")]
struct Cli {
    /// Engine configuration file (TOML or JSON)
    #[arg(long, env = "CONDUIT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Worker slots (overrides config)
    #[arg(long, env = "CONDUIT_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Validate the configuration and exit
    #[arg(long, default_value_t = false)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,conduit::scheduler=info,conduit::cascade=info,conduit::maintainer=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ConfigLoad {
        config,
        source,
        warnings,
    } = load_config(&cli).context("failed to load configuration")?;

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(%hint, "{}", warning.message),
            None => warn!("{}", warning.message),
        }
    }

    if cli.check {
        info!(?source, "configuration is valid");
        return Ok(());
    }

    let engine = Engine::builder(config)
        .build()
        .context("failed to build operation engine")?;
    engine.start().await;
    info!(
        pool_size = engine.scheduler().pool_size(),
        "operation engine started"
    );

    let mut events = engine.events().subscribe();
    let log_events = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event.payload {
                    OperationEventPayload::Failed {
                        orphan_mitigation, ..
                    } => warn!(
                        operation_id = %event.meta.operation_id,
                        resource_type = %event.meta.resource_type,
                        resource_id = %event.meta.resource_id,
                        orphan_mitigation,
                        "operation failed"
                    ),
                    payload => debug!(
                        operation_id = %event.meta.operation_id,
                        category = %event.meta.category,
                        ?payload,
                        "operation event"
                    ),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "operation event log lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    engine.shutdown().await;
    log_events.abort();
    info!("operation engine stopped");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ConfigLoad> {
    // Clap already folded $CONDUIT_CONFIG_PATH into `cli.config`.
    let mut loader = ConfigLoader::from_env();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut load = loader.load()?;

    if let Some(pool_size) = cli.pool_size {
        load.config.pool.pool_size = pool_size;
        conduit_config::apply_guard_rails(&load.config)
            .context("invalid --pool-size")?;
    }
    Ok(load)
}
