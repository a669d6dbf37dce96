//! steward controller
//!
//! Reconciles the resources declared in a manifest directory against the live
//! system and serves per-resource status over HTTP.

use std::sync::Arc;

use anyhow::Result;
use steward_controller::{api, config, manifest::ManifestStore, state::AppState};
use steward_reconcile::{MemoryCluster, Reconciler};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to STEWARD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting steward controller");
    info!(
        listen_addr = %config.listen_addr,
        manifest_dir = %config.manifest_dir.display(),
        workers = config.reconciler.workers,
        max_attempts = config.reconciler.retry.max_attempts,
        prune = config.reconciler.prune,
        default_ownership = ?config.default_ownership,
        "Configuration loaded"
    );

    let store = Arc::new(ManifestStore::new(
        config.manifest_dir.clone(),
        config.default_ownership.ownership(),
    ));

    // The live system is simulated in-process until a real cluster client is wired in.
    warn!("Using in-memory live system");
    let cluster = Arc::new(MemoryCluster::new());

    let reconciler = Reconciler::new(config.reconciler.clone(), store, cluster);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(reconciler));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to the reconciler
    let _ = shutdown_tx.send(true);

    info!("Waiting for reconciler to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconciler_handle).await {
        warn!(error = %e, "Reconciler did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
