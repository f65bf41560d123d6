//! HTTP surface: phase invocation, session lookup and progress streaming.

pub mod api;
mod events;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use api::{AppState, SharedState};

use crate::config::DossierConfig;
use crate::gate::QualityGate;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::orchestrator::workers::{EnrichmentWorker, ExtractionWorker, GenerationWorker};
use crate::orchestrator::{PhaseService, Pipeline, WorkerRegistry};
use crate::pool::{BrowserlessLauncher, ScraperPool};
use crate::progress::ProgressHub;
use crate::session::{MemorySessionStore, SessionStore, SqliteSessionStore};

impl AppState {
    /// Wire every component from configuration around `store`.
    pub fn from_config(config: &DossierConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let launcher = BrowserlessLauncher::new(
            &config.engine.browserless_url,
            config.engine.token.as_deref(),
            Duration::from_secs(config.engine.request_timeout_secs),
        )
        .context("Failed to create Browserless client")?;
        let pool = ScraperPool::new(config.pool_config(), Arc::new(launcher))
            .context("Invalid scraper pool configuration")?;
        let hub = Arc::new(ProgressHub::new(config.hub_config()));

        let mut workers = WorkerRegistry::new().with(Arc::new(ExtractionWorker::new(
            pool.clone(),
            config.extraction_settings(),
        )));
        if config.llm.endpoint.trim().is_empty() {
            tracing::warn!("llm.endpoint not set; enrichment and generation are unavailable");
        } else {
            let llm: Arc<dyn LlmClient> = Arc::new(
                HttpLlmClient::new(
                    &config.llm.endpoint,
                    config.llm.api_key.as_deref(),
                    &config.llm.model,
                    Duration::from_secs(config.llm.request_timeout_secs),
                )
                .context("Failed to create LLM client")?,
            );
            workers.register(Arc::new(EnrichmentWorker::new(Arc::clone(&llm))));
            workers.register(Arc::new(GenerationWorker::new(llm)));
        }

        let pipeline = Pipeline::new(
            store,
            Arc::new(QualityGate::new(config.gates.clone())),
            Arc::clone(&hub),
            workers,
            config.orchestrator_config(),
        );

        Ok(Self {
            service: PhaseService::new(pipeline),
            pool,
            hub,
        })
    }
}

/// Open the configured session store, creating the database directory.
pub fn open_store(config: &DossierConfig) -> Result<Arc<dyn SessionStore>> {
    match config.db_path() {
        None => Ok(Arc::new(MemorySessionStore::new())),
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
            let store = SqliteSessionStore::open(&path)
                .with_context(|| format!("Failed to open session database {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until Ctrl+C, then close the hub and drain the pool.
pub async fn start_server(config: DossierConfig) -> Result<()> {
    let store = open_store(&config)?;
    let state = Arc::new(AppState::from_config(&config, store)?);

    let maintenance = state.hub.spawn_maintenance();
    let reaper = state.pool.spawn_reaper();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local: SocketAddr = listener.local_addr().context("Listener has no local address")?;
    tracing::info!(%local, "dossier server listening");

    axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await
        .context("Server error")?;

    reaper.abort();
    maintenance.abort();
    state.pool.shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(state: SharedState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
    // Ends every open event stream so the server can drain.
    state.hub.close();
}
