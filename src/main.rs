//! Wish Market Daemon
//!
//! Owns the marketplace store and runs the background reconcilers.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (SQLite store under the local data dir)
//! wish-market
//!
//! # Start with custom config
//! wish-market --config /path/to/config.toml
//!
//! # Volatile in-memory store with short leases
//! wish-market --backend memory --lease-ttl-secs 600
//! ```
//!
//! ## Background Loops
//!
//! - Funding reconciler: confirms provisional funding proofs
//! - Ingestion reconciler: turns pending wish records into proposals

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wish_market::ingestion::SqliteIngestionSource;
use wish_market::services::{self, spawn_logging_listener};
use wish_market::{Config, FundingReconciler, IngestionReconciler, SimulatedFundingProvider, StoreBackend};

#[derive(Parser, Debug)]
#[command(name = "wish-market")]
#[command(about = "Task marketplace engine for worker agents")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "WISH_MARKET_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "WISH_MARKET_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Store backend (sqlite | memory)
    #[arg(long, env = "WISH_MARKET_BACKEND")]
    backend: Option<StoreBackend>,

    /// Claim lease length in seconds
    #[arg(long, env = "WISH_MARKET_LEASE_TTL_SECS")]
    lease_ttl_secs: Option<u64>,

    /// Funding reconciler interval in seconds
    #[arg(long)]
    funding_interval_secs: Option<u64>,

    /// Ingestion reconciler interval in seconds
    #[arg(long)]
    ingestion_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wish_market=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(ttl) = args.lease_ttl_secs {
        config.lease_ttl_secs = ttl;
    }
    if let Some(secs) = args.funding_interval_secs {
        config.funding_interval_secs = secs;
    }
    if let Some(secs) = args.ingestion_interval_secs {
        config.ingestion_interval_secs = secs;
    }
    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        backend = %config.backend,
        lease_ttl_secs = config.lease_ttl_secs,
        "Starting wish-market"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let service = services::open(&config)?;
    let logger = spawn_logging_listener(Arc::clone(service.events()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let provider = Arc::new(SimulatedFundingProvider::new(config.simulated_block_height));
    let funding = FundingReconciler::new(
        Arc::clone(&service),
        provider,
        Duration::from_secs(config.funding_interval_secs),
    )
    .with_shutdown(shutdown_tx.subscribe());

    let source = Arc::new(SqliteIngestionSource::open(&config.ingestion_db_path())?);
    let ingestion = IngestionReconciler::new(
        Arc::clone(&service),
        source,
        Duration::from_secs(config.ingestion_interval_secs),
        config.ingestion_batch_size,
    )
    .with_shutdown(shutdown_tx.subscribe());

    let funding_handle = tokio::spawn(funding.run());
    let ingestion_handle = tokio::spawn(ingestion.run());

    info!("Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    let _ = shutdown_tx.send(());
    let _ = funding_handle.await;
    let _ = ingestion_handle.await;
    logger.abort();

    info!(events = service.events().len(), "Stopped");
    Ok(())
}
