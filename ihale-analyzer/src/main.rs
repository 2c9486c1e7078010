//! ihale-analyzer - batch document analysis service
//!
//! Accepts batches of tender documents, runs them one batch at a time
//! through the extraction backend and streams progress over SSE.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ihale_common::config::{load_config, ConfigOverrides};
use ihale_analyzer::extraction::HttpExtractor;
use ihale_analyzer::worker::Worker;
use ihale_analyzer::{AnalysisHub, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for the running document to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Command-line arguments for ihale-analyzer
#[derive(Parser, Debug)]
#[command(name = "ihale-analyzer")]
#[command(about = "Batch document analysis service")]
#[command(version)]
struct Args {
    /// Path to ihale.toml
    #[arg(short, long, env = "IHALE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database holding the documents table
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Extraction backend endpoint
    #[arg(short, long)]
    backend_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&ConfigOverrides {
        config_path: args.config,
        port: args.port,
        database_path: args.database,
        backend_url: args.backend_url,
    })
    .context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ihale_analyzer={0},tower_http={0}", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ihale-analyzer on port {}", config.port);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database_path.display());
    info!("Extraction backend: {}", config.analysis.backend_url);

    let db_pool = ihale_analyzer::db::init_database_pool(&config.database_path)
        .await
        .context("Failed to open database")?;
    info!("Database connection established");

    let extractor = HttpExtractor::new(
        config.analysis.backend_url.clone(),
        config.analysis.document_timeout(),
    )
    .context("Failed to create extraction client")?;

    let hub = AnalysisHub::new(&config.analysis);
    let worker_shutdown = CancellationToken::new();
    let worker = Worker::new(
        &hub,
        Arc::new(extractor),
        db_pool.clone(),
        config.analysis.clone(),
    )
    .spawn(worker_shutdown.clone());

    let state = AppState::new(hub.clone(), db_pool, config.analysis.clone());
    let app = ihale_analyzer::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);

    let shutdown = async move {
        shutdown_signal().await;
        // Running batch stops after its current document
        hub.queue.close();
        worker_shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
            warn!("Worker did not stop within {:?}", SHUTDOWN_GRACE);
        }
        // Open SSE streams would otherwise hold the server
        hub.broadcaster.disconnect_all();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
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
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
