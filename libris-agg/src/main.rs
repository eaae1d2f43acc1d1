//! libris-agg - book metadata aggregation service
//!
//! Fans a lookup out to the catalog, storefront, ratings and publisher
//! providers, merges what comes back and serves it from a two-tier cache.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libris_common::config::{RootFolderInitializer, RootFolderResolver};
use libris_common::events::EventBus;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use libris_agg::cache::{MemoryFastTier, SqliteBookStore};
use libris_agg::config::{ServiceConfig, MODULE_NAME};
use libris_agg::import::{HttpListSources, JobRunner};
use libris_agg::orchestrator::AggregationOrchestrator;
use libris_agg::AppState;

/// Command-line arguments for libris-agg
#[derive(Parser, Debug)]
#[command(name = "libris-agg")]
#[command(about = "Book metadata aggregation service")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the configured bind address port)
    #[arg(short, long, env = "LIBRIS_PORT")]
    port: Option<u16>,

    /// Root folder holding the database
    #[arg(short, long, env = "LIBRIS_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long, env = "LIBRIS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServiceConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(config.logging.ansi))
        .init();

    info!("Starting libris-agg version {}", env!("CARGO_PKG_VERSION"));

    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone().or_else(|| config.root_folder.clone()))
        .with_config_file(args.config.clone())
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = libris_agg::db::init_database_pool(&db_path).await?;

    config.resolve_credentials(&db_pool).await?;

    let orphaned = libris_agg::db::jobs::fail_orphaned_jobs(&db_pool).await?;
    if orphaned > 0 {
        warn!(count = orphaned, "Marked interrupted import jobs as failed");
    }

    let event_bus = EventBus::new(256);
    let _recorder = libris_agg::db::provider_stats::spawn_recorder(db_pool.clone(), &event_bus);

    let providers = libris_agg::providers::build_providers(&config.providers)?;
    if providers.is_empty() {
        warn!("No providers enabled; every lookup will fail");
    }
    info!(
        providers = ?providers.iter().map(|p| p.id().as_str()).collect::<Vec<_>>(),
        "Providers initialized"
    );

    let fast = Arc::new(MemoryFastTier::new(config.cache.max_entries));
    let durable = Arc::new(SqliteBookStore::new(db_pool.clone()));
    let orchestrator = Arc::new(AggregationOrchestrator::from_config(
        &config,
        providers,
        fast,
        durable,
        event_bus.clone(),
    ));

    let sources = Arc::new(HttpListSources::new(&config.import, &config.providers)?);
    let jobs = Arc::new(JobRunner::new(
        db_pool.clone(),
        orchestrator.clone(),
        sources,
        config.import.clone(),
        event_bus.clone(),
    ));

    let state = AppState::new(db_pool, orchestrator, jobs.clone(), event_bus);
    let app = libris_agg::build_router(state);

    let mut addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind_address {}", config.bind_address))?;
    if let Some(port) = args.port {
        addr.set_port(port);
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    jobs.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
