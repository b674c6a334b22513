//! Agent protocol endpoint: the small HTTP surface consumed by host
//! agents — long-poll for work, report outcomes, heartbeat, and push
//! fleet-visibility gauges.
//!
//! Every request here is authenticated (and the agent row upserted on
//! first contact) by `require_agent_host` / `agent_auth_middleware`;
//! handlers only see an already-validated `HostId`.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use std::time::Duration;

use crate::api::state::AppState;
use crate::api::types::{
    AgentMetricsRequest, HeartbeatRequest, HeartbeatResponse, PollTasksQuery,
    ReportTaskStatusRequest, TaskResponse,
};
use crate::error::{PhoenixError, Result};
use crate::model::{effective_health, AgentHealth, AgentRecord, HostId, TaskId};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(poll_tasks))
        .route("/tasks/:id/status", post(report_task_status))
        .route("/heartbeat", post(heartbeat))
        .route("/metrics", post(push_metrics))
}

/// The host identity an upstream auth middleware attaches to the
/// request after validating `X-Agent-Host-ID`.
#[derive(Clone)]
pub struct AuthenticatedHost(pub HostId);

async fn poll_tasks(
    State(state): State<AppState>,
    Extension(AuthenticatedHost(host_id)): Extension<AuthenticatedHost>,
    Query(query): Query<PollTasksQuery>,
) -> Result<Json<Vec<TaskResponse>>> {
    let max_wait = query
        .max_wait_secs
        .map(Duration::from_secs)
        .unwrap_or(state.config.long_poll_default_wait)
        .min(state.config.long_poll_max_wait);
    let capabilities = match state.store.get_agent(&host_id).await? {
        Some(agent) => agent.capabilities.keys().cloned().collect::<Vec<_>>(),
        None => vec!["collector".into(), "loadsim".into(), "command".into()],
    };
    let max_tasks = query.max_tasks.unwrap_or(4).max(1);
    let tasks = state
        .queue
        .poll(&host_id, &capabilities, max_tasks, max_wait)
        .await?;
    Ok(Json(tasks.into_iter().map(Into::into).collect()))
}

async fn report_task_status(
    State(state): State<AppState>,
    Extension(AuthenticatedHost(_host_id)): Extension<AuthenticatedHost>,
    Path(id): Path<String>,
    Json(req): Json<ReportTaskStatusRequest>,
) -> Result<Json<TaskResponse>> {
    let id: TaskId = id
        .parse()
        .map_err(|_| PhoenixError::Validation(format!("invalid task id: {id}")))?;
    let task = state
        .store
        .report_task(&id, req.status, req.result, req.error, Utc::now())
        .await?;
    if let Some(experiment_id) = task.experiment_id {
        if let Some(config) = task.config.get("deployment_id").and_then(|v| v.as_str()) {
            if let Ok(deployment_id) = config.parse() {
                let status = match req.status {
                    crate::model::TaskStatus::Completed => match task.action {
                        crate::model::TaskAction::Stop | crate::model::TaskAction::Rollback => {
                            Some(crate::model::DeploymentStatus::Stopped)
                        }
                        crate::model::TaskAction::Start | crate::model::TaskAction::Update => {
                            Some(crate::model::DeploymentStatus::Running)
                        }
                        crate::model::TaskAction::Execute => None,
                    },
                    crate::model::TaskStatus::Failed => {
                        Some(crate::model::DeploymentStatus::Failed)
                    }
                    _ => None,
                };
                if let Some(status) = status {
                    state
                        .controller
                        .on_deployment_status(&deployment_id, status, task.error.clone())
                        .await?;
                }
            }
        }
        let _ = experiment_id;
    }
    Ok(Json(task.into()))
}

async fn heartbeat(
    State(state): State<AppState>,
    Extension(AuthenticatedHost(host_id)): Extension<AuthenticatedHost>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    let now = Utc::now();
    let active_task_ids = req
        .active_task_ids
        .iter()
        .filter_map(|id| id.parse().ok())
        .collect();
    let existing = state.store.get_agent(&host_id).await?;
    let record = AgentRecord {
        host_id: host_id.clone(),
        hostname: req.hostname,
        address: req.address,
        version: req.version,
        first_seen: existing.map(|a| a.first_seen).unwrap_or(now),
        last_heartbeat: now,
        health: AgentHealth::Healthy,
        capabilities: req.capabilities,
        active_task_ids,
        resource_usage: req.resource_usage,
    };
    state.store.upsert_agent(record).await?;
    let health = effective_health(AgentHealth::Healthy, now, now, state.config.offline_after);
    Ok(Json(HeartbeatResponse { host_id: host_id.to_string(), health }))
}

async fn push_metrics(
    Extension(AuthenticatedHost(host_id)): Extension<AuthenticatedHost>,
    Json(req): Json<AgentMetricsRequest>,
) -> Result<Json<serde_json::Value>> {
    // Fleet-visibility gauges only — not fed into KPI analysis, which
    // always queries the metrics backend directly.
    tracing::debug!(%host_id, gauges = req.gauges.len(), "received agent metrics push");
    Ok(Json(serde_json::json!({ "accepted": req.gauges.len() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::model::{Task, TaskAction, TaskType};
    use axum::http::StatusCode;
    use axum::middleware::{self, Next};
    use axum::extract::Request;
    use axum::response::Response;
    use tower::ServiceExt;

    async fn inject_host(mut request: Request, next: Next) -> Response {
        request.extensions_mut().insert(AuthenticatedHost(HostId::from("h1")));
        next.run(request).await
    }

    fn test_router(state: AppState) -> Router<()> {
        routes()
            .layer(middleware::from_fn(inject_host))
            .with_state(state)
    }

    #[tokio::test]
    async fn poll_returns_empty_quickly_when_no_work_and_short_wait() {
        let state = AppState::new(ServerConfig::default());
        let router = test_router(state);
        let response = router
            .oneshot(
                axum::http::Request::get("/tasks?max_wait_secs=0")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn poll_returns_enqueued_task_for_matching_host() {
        let state = AppState::new(ServerConfig::default());
        state
            .queue
            .enqueue(Task::new(
                HostId::from("h1"),
                None,
                TaskType::Command,
                TaskAction::Execute,
                serde_json::json!({}),
                0,
            ))
            .await
            .unwrap();
        let router = test_router(state);
        let response = router
            .oneshot(
                axum::http::Request::get("/tasks")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let tasks: Vec<TaskResponse> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_upserts_agent_record() {
        let state = AppState::new(ServerConfig::default());
        let router = test_router(state.clone());
        let body = serde_json::to_vec(&serde_json::json!({
            "hostname": "box1",
            "address": "10.0.0.1:9999",
            "version": "1.0.0",
        }))
        .unwrap();
        let response = router
            .oneshot(
                axum::http::Request::post("/heartbeat")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.get_agent(&HostId::from("h1")).await.unwrap().is_some());
    }
}
