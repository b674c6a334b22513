//! Phoenix control plane server entry point.
//!
//! Builds configuration from the environment, selects the in-memory or
//! PostgreSQL-backed store, spawns the experiment controller's
//! background ticker alongside the HTTP API, and shuts both down
//! together on SIGINT/SIGTERM.

use std::sync::Arc;

use phoenix_core::analyzer::{AnalysisRunner, Analyzer, RecordingMetricsBackend};
use phoenix_core::api::{ApiConfig, ApiServer};
use phoenix_core::config::ServerConfig;
use phoenix_core::store::Store;
use phoenix_core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let server_config = ServerConfig::from_env();
    tracing::info!(bind_addr = %server_config.bind_addr, "loaded phoenix control plane configuration");

    let store = build_store(&server_config).await?;
    let analyzer: Arc<dyn AnalysisRunner> = Arc::new(Analyzer::new(
        RecordingMetricsBackend::default(),
        server_config.cost_model,
        server_config.critical_process_names.clone(),
    ));

    let state = phoenix_core::api::AppState::with_store_and_analyzer(store, analyzer, server_config.clone());
    let controller = state.controller.clone();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ticker = tokio::spawn(controller.run_ticker(shutdown_rx));

    let config = ApiConfig {
        bind_addr: server_config.bind_addr,
        server: server_config,
    };
    let server = ApiServer::with_state(state, config);

    server.run_until(shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    let _ = ticker.await;

    Ok(())
}

/// Selects the store backed by `PHOENIX_DATABASE_URL` when the
/// `postgres` feature is compiled in, falling back to the in-memory
/// store for local runs and tests.
async fn build_store(config: &ServerConfig) -> Result<Arc<dyn Store>> {
    #[cfg(feature = "postgres")]
    if let Some(database_url) = &config.database_url {
        use phoenix_core::store::postgres::PostgresStore;

        tracing::info!("connecting to postgres store");
        let store = PostgresStore::connect(database_url).await?;
        store.migrate().await?;
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "postgres"))]
    if config.database_url.is_some() {
        tracing::warn!(
            "PHOENIX_DATABASE_URL is set but this binary was built without the `postgres` feature; falling back to the in-memory store"
        );
    }

    use phoenix_core::store::memory::InMemoryStore;
    tracing::info!("using in-memory store");
    Ok(Arc::new(InMemoryStore::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for sigterm");
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
    tracing::info!("shutdown signal received");
}
