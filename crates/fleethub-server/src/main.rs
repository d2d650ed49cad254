//! # FleetHub
//!
//! Realtime driver tracking and dispatch hub.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! fleethub
//!
//! # Run with custom config
//! fleethub --config /path/to/fleethub.toml
//!
//! # Run with environment variables
//! FLEETHUB_PORT=8080 FLEETHUB_AUTH__POLICY=reject_missing_token fleethub
//! ```

use anyhow::{bail, Result};
use fleethub_server::{config::Config, handlers, metrics};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleethub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path_arg(std::env::args().skip(1))? {
        Some(path) => Config::layered(Some(path.as_path()))?,
        None => Config::load()?,
    };

    info!("Starting FleetHub server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config, shutdown_signal()).await?;

    info!("FleetHub server stopped");
    Ok(())
}

/// Parse `--config <path>` (or `--config=<path>`).
fn config_path_arg(mut args: impl Iterator<Item = String>) -> Result<Option<PathBuf>> {
    let mut path = None;
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            match args.next() {
                Some(value) => path = Some(PathBuf::from(shellexpand::tilde(&value).into_owned())),
                None => bail!("--config requires a path"),
            }
        } else if let Some(value) = arg.strip_prefix("--config=") {
            path = Some(PathBuf::from(shellexpand::tilde(value).into_owned()));
        } else {
            bail!("Unknown argument: {arg}");
        }
    }
    Ok(path)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
