//! # Webhook Ingest Main Entry Point
//!
//! Loads configuration, initializes tracing and the event store, then serves
//! the webhook API until a shutdown signal arrives.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use webhook_ingest::{
    config::ConfigLoader,
    db,
    migration::{Migrator, MigratorTrait},
    server::run_server,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "webhook-ingest", version, about = "Signed webhook ingestion service")]
struct Cli {
    /// Directory holding the layered `.env` files (defaults to the working directory)
    #[arg(long, value_name = "DIR")]
    env_dir: Option<PathBuf>,

    /// Skip applying database migrations on startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = match cli.env_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("loading configuration")?;

    telemetry::init_tracing(&config).context("initializing tracing")?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    if cli.skip_migrations {
        tracing::warn!("Skipping database migrations");
    } else {
        Migrator::up(&db, None)
            .await
            .context("applying database migrations")?;
    }

    run_server(config, db).await
}
