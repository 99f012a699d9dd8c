use anyhow::{Context, Result};
use clap::Parser;
use murmur_relay::Hub;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod auth;
mod config;
mod db;
mod messages;
mod server;
mod telemetry;

use auth::JwtValidator;
use config::ServerConfig;
use db::{Database, MigrationRunner};
use server::AppState;

/// Murmur relay server
#[derive(Debug, Parser)]
#[command(name = "murmur-server", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "MURMUR_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    bind: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    telemetry::init(config.server.json_logs)?;
    info!("Murmur Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let db = match &config.database.path {
        Some(path) => Database::open_local("murmur", path).await,
        None => {
            warn!("No database path configured; messages will not survive a restart");
            Database::in_memory("murmur").await
        }
    }
    .context("Failed to open database")?;

    let migrations = MigrationRunner::default();
    if migrations.has_pending(&db).await? {
        migrations
            .run(&db)
            .await
            .context("Failed to run migrations")?;
    }

    let shutdown = CancellationToken::new();
    let (hub, hub_task) = Hub::spawn(&config.relay, shutdown.clone());
    let state = Arc::new(AppState::new(
        db,
        hub,
        JwtValidator::new(&config.auth),
        config.relay.clone(),
    ));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let served = server::start(state, &config.server.bind, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = hub_task.await {
        warn!("Hub task ended abnormally: {}", e);
    }
    telemetry::shutdown();
    served
}
