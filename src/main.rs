use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kubelite::cli::Args;
use kubelite::config::Config;
use kubelite::controller::ControllerManager;
use kubelite::server::{create_router, AppState};
use kubelite::store::open_store;

/// Budget for draining controllers and watches after a signal.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Load configuration and apply CLI overrides
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.node_name.is_some() {
        config.node_name = args.node_name.clone();
    }

    // Open the storage backend
    let store = match open_store(&config.storage).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open storage backend: {}", e);
            process::exit(1);
        }
    };
    info!("Storage backend: {:?}", config.storage.backend);

    // Start the controller fabric
    let node_name = config.resolve_node_name();
    info!("Node name: {}", node_name);
    let manager = ControllerManager::start(store.clone(), node_name).await;

    // Create and run the server
    let watch_store = store.clone();
    let state = AppState::new(store);
    let app = create_router(state, config.server.cors);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("API server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /api/health                                - Health check");
    info!("  *    /api/v1/[namespaces/ns/]<resource>[/name]  - Core resources");
    info!("  *    /apis/apps/v1/...                          - Workload resources");
    info!("  GET  /api/v1/watch/...                          - Watch streams (SSE)");

    // On signal, close every watch channel so open SSE streams finish
    // instead of holding graceful shutdown until their timeouts.
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            watch_store.shutdown();
        })
        .await
    {
        error!("Server error: {}", e);
        process::exit(1);
    }

    info!("Shutting down");
    manager.shutdown(SHUTDOWN_BUDGET).await;
}

/// Resolves when SIGINT, SIGTERM, or SIGQUIT arrives.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            process::exit(1);
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(signal) => signal,
        Err(e) => {
            error!("Failed to install SIGQUIT handler: {}", e);
            process::exit(1);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
        _ = quit.recv() => info!("Received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt");
}
