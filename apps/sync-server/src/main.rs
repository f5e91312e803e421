//! # LeadSync Sync Server
//!
//! Webhook receiver and poll loop for amoCRM ↔ Google Sheets reconciliation.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Server Startup                             │
//! │                                                                         │
//! │  config ──► table backend ──► CRM client ──► sync state ──► engine     │
//! │                                                               │         │
//! │                       initialize (pipelines, statuses, users) │         │
//! │                       bootstrap (adopt existing rows)         │         │
//! │                                                               ▼         │
//! │                              ┌────────────────┬──────────────────┐     │
//! │                              │ axum (webhook) │ Poller (interval)│     │
//! │                              └────────────────┴──────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use leadsync_server::{router, AppState};
use leadsync_store::{GoogleSheetsBackend, MemoryBackend, ServiceAccountKey, SyncStateStore, TableBackend};
use leadsync_sync::{
    bootstrap_with_retry, BackendKind, Poller, RateLimitedApiClient, ReconciliationEngine,
    SyncConfig, SystemClock, Throttle, TokenManager,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "amoCRM ↔ Google Sheets lead sync", long_about = None)]
struct Cli {
    /// TOML config file (defaults to the platform config dir)
    #[arg(long, env = "LEADSYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("Starting LeadSync server...");

    let config = SyncConfig::load(cli.config).context("loading configuration")?;
    info!(
        backend = %config.table.backend,
        worksheet = %config.table.worksheet,
        port = config.server.port,
        "Configuration loaded"
    );

    // Table backend
    let backend: Arc<dyn TableBackend> = match config.table.backend {
        BackendKind::Google => {
            let key = ServiceAccountKey::from_file(&config.table.service_account_file)
                .await
                .with_context(|| {
                    format!(
                        "reading service account key {}",
                        config.table.service_account_file.display()
                    )
                })?;
            Arc::new(GoogleSheetsBackend::new(key, config.table.spreadsheet_id.clone())?)
        }
        BackendKind::Memory => {
            warn!("Using in-memory table backend, rows will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
    };

    // CRM client
    let throttle = Arc::new(Throttle::new(Duration::from_millis(config.crm.request_delay_ms)));
    let tokens = Arc::new(TokenManager::new(&config.crm, throttle.clone())?);
    let crm = Arc::new(RateLimitedApiClient::new(&config.crm, tokens, throttle)?);

    // Engine
    let state = SyncStateStore::load(config.sync.state_file.clone())
        .await
        .context("loading sync state")?;
    let bootstrap_attempts = config.sync.bootstrap_attempts;
    let bootstrap_wait = Duration::from_secs(config.sync.bootstrap_wait_secs);
    let bind_address = config.server.bind_address();

    let engine = Arc::new(ReconciliationEngine::new(
        config,
        crm.clone(),
        backend,
        state,
        Arc::new(SystemClock),
    )?);
    engine.initialize().await.context("loading CRM catalog")?;

    match bootstrap_with_retry(&engine, bootstrap_attempts, bootstrap_wait).await {
        Ok(adopted) => info!(adopted, "Existing rows adopted"),
        Err(e) => warn!(error = %e, "Bootstrap failed, continuing without it"),
    }

    // Background poller
    let (poller, poller_handle) = Poller::new(engine.clone());
    let poller_task = tokio::spawn(poller.run());

    // HTTP server
    let app = router(Arc::new(AppState { engine, crm }));
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    info!(addr = %bind_address, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = poller_handle.shutdown().await {
        warn!(error = %e, "Poller already stopped");
    }
    if let Err(e) = poller_task.await {
        warn!(error = %e, "Poller task ended abnormally");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
