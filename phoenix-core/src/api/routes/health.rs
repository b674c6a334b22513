//! Liveness and readiness checks.
//!
//! - `/health` — basic liveness, always succeeds if the process is up.
//! - `/ready` — readiness: the store answers a trivial read.
//! - `/` — service banner.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::api::state::AppState;
use crate::store::ExperimentFilter;

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/", get(root))
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    description: &'static str,
}

async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "phoenix",
        version: env!("CARGO_PKG_VERSION"),
        description: "A/B experiment control plane for observability collector pipelines",
    })
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy",
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Debug, Serialize)]
struct ReadinessStatus {
    ready: bool,
    store: bool,
    error: Option<String>,
}

async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<ReadinessStatus>, (StatusCode, Json<ReadinessStatus>)> {
    match state.store.list_experiments(ExperimentFilter::default()).await {
        Ok(_) => Ok(Json(ReadinessStatus {
            ready: true,
            store: true,
            error: None,
        })),
        Err(e) => {
            let status = ReadinessStatus {
                ready: false,
                store: false,
                error: Some(e.to_string()),
            };
            Err((StatusCode::SERVICE_UNAVAILABLE, Json(status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_reports_healthy() {
        let response = health_check().await;
        assert_eq!(response.status, "healthy");
    }

    #[tokio::test]
    async fn readiness_check_passes_on_fresh_in_memory_store() {
        let state = AppState::new(crate::config::ServerConfig::default());
        let result = readiness_check(State(state)).await;
        assert!(result.is_ok());
        assert!(result.unwrap().ready);
    }
}
