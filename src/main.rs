//! # Permission Sync Worker Entry Point
//!
//! Runs the repo and user permission sync workers and their resetters
//! against the configured database until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use permsync::{
    authz::ProviderRegistry, config::ConfigLoader, db, service::PermsSyncService, telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_HOSTNAME: &str = "permsync-worker";

#[derive(Parser, Debug)]
#[command(name = "permsync-worker", version, about = "Permission sync worker")]
struct Args {
    /// Directory holding the layered `.env` files
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Skip applying database migrations on startup
    #[arg(long)]
    skip_migrations: bool,

    /// Name recorded on claimed jobs (defaults to $HOSTNAME)
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loader = match args.config_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    if args.skip_migrations {
        info!("Skipping database migrations");
    } else {
        db::migrate(&db).await.context("running database migrations")?;
    }

    // Code host integrations register themselves on the shared registry.
    let providers = Arc::new(ProviderRegistry::new());
    if providers.snapshot().is_empty() {
        warn!("No authorization providers registered; repo and user syncs will be no-ops");
    }

    let hostname = args
        .hostname
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());

    let service = PermsSyncService::new(Arc::new(db), providers, config, hostname);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => warn!(error = %err, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    service.run(shutdown).await;
    Ok(())
}
