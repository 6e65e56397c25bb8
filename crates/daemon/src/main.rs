//! meshplane daemon
//!
//! Opens the entity store and runs the network map propagator.

use clap::Parser;
use meshplane_common::Database;
use meshplane_daemon::{
    AccountManager, ManagementConfig, NetworkMapPropagator, PeersUpdateManager, StoreActivitySink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "meshplaned")]
#[command(about = "meshplane daemon - mesh VPN management service")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESHPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// DNS domain for peer names
    #[arg(long)]
    dns_domain: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("meshplane daemon v{}", meshplane_common::VERSION);

    // Load configuration, command line wins
    let config_path = cli
        .config
        .unwrap_or_else(|| meshplane_common::default_store_path().join("config.toml"));
    let mut config = ManagementConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(domain) = cli.dns_domain {
        config.dns_domain = domain;
    }

    tokio::fs::create_dir_all(&config.store_path).await?;
    let db = Database::open(config.db_path(), config.busy_timeout())?;

    // Start propagator
    let peers = Arc::new(PeersUpdateManager::new(config.propagation.peer_channel_capacity));
    let (propagator, handle) = NetworkMapPropagator::new(db.clone(), peers, config.dns_domain.clone());
    let shutdown = CancellationToken::new();
    let mut propagator_handle = tokio::spawn(propagator.run(shutdown.clone()));

    let _manager = AccountManager::new(
        db.clone(),
        Arc::new(StoreActivitySink::new(db.clone())),
        Arc::new(handle),
        config.dns_domain.clone(),
    );

    info!("Management service ready, store at {:?}", config.db_path());

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut propagator_handle => {
            if let Err(e) = result {
                error!("Propagator error: {}", e);
            }
        }
    }

    shutdown.cancel();
    if !propagator_handle.is_finished() {
        let _ = propagator_handle.await;
    }

    info!("Daemon shutdown complete");
    Ok(())
}
