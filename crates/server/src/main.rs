use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mps_relay_core::{
    load_config, load_config_from_env, validate_config, AriaCliService, Config, ConversionService,
    HttpObjectStore, JobOrchestrator, ObjectStore,
};
use mps_relay_server::api::create_router;
use mps_relay_server::state::{AppState, Orchestrator};

/// How long unfinished runs get to wind down after shutdown cancels them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load(config_path())?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!(
        "Default concurrency: {}, upload concurrency: {}",
        config.orchestrator.default_concurrency, config.orchestrator.upload_concurrency
    );

    let converter: Arc<dyn ConversionService> = Arc::new(AriaCliService::new(config.aria.clone()));
    if let Err(e) = converter.validate().await {
        // Upload-only runs still work without the CLI.
        warn!("Conversion service unavailable: {}", e);
    }

    let mut orchestrator: Orchestrator = JobOrchestrator::new(
        config.orchestrator.clone(),
        config.layout.clone(),
        converter,
    );
    if config.storage.is_configured() {
        let store: Arc<dyn ObjectStore> = Arc::new(
            HttpObjectStore::new(config.storage.clone())
                .context("Failed to create object store")?,
        );
        info!(
            "Using object store {} (bucket: {})",
            store.name(),
            config.storage.bucket
        );
        orchestrator = orchestrator.with_storage(store, &config.storage);
    } else {
        info!("Object storage not configured, upload modes are disabled");
    }

    let state = Arc::new(AppState::new(config.clone(), Arc::new(orchestrator)));
    let app = create_router(Arc::clone(&state));

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    state.cancel_all();
    let unfinished: Vec<_> = state
        .run_summaries()
        .into_iter()
        .filter(|summary| !summary.finished)
        .filter_map(|summary| state.run(&summary.run_id))
        .collect();
    for handle in unfinished {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle.wait()).await.is_err() {
            warn!(run_id = %handle.run_id(), "Run did not finish before shutdown");
        }
    }
    info!("All runs stopped");

    Ok(())
}

/// Config file from the first argument, else `MPS_RELAY_CONFIG`, else
/// `config.toml` when present.
fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MPS_RELAY_CONFIG").ok())
        .map(PathBuf::from)
        .or_else(|| Some(PathBuf::from("config.toml")).filter(|p| p.exists()))
}

fn load(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            load_config(&path).with_context(|| format!("Failed to load config from {:?}", path))
        }
        None => {
            info!("No configuration file, using defaults and environment");
            load_config_from_env().context("Failed to load config from environment")
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
