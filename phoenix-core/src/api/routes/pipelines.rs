//! Pipeline template catalog, server-side validation, and ad-hoc
//! deployments outside the lifecycle of an experiment.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use crate::api::state::AppState;
use crate::api::types::{
    AdhocDeployRequest, DeploymentResponse, PutTemplateRequest, TemplateResponse,
    ValidateTemplateRequest, ValidateTemplateResponse,
};
use crate::error::{PhoenixError, Result};
use crate::model::{DeploymentId, DeploymentMetrics, DeploymentStatus, HostId, PipelineDeployment};
use crate::templates::{self, RenderContext};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/templates", get(list_templates).put(put_template))
        .route("/templates/:name/:version", get(get_template))
        .route("/validate", post(validate_template))
        .route("/deployments", post(create_adhoc_deployment).get(list_deployments))
        .route("/deployments/:id", axum::routing::delete(stop_deployment))
}

async fn list_templates(State(state): State<AppState>) -> Result<Json<Vec<TemplateResponse>>> {
    let templates = state.store.list_templates().await?;
    Ok(Json(templates.into_iter().map(Into::into).collect()))
}

async fn get_template(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<TemplateResponse>> {
    let template = state
        .store
        .get_template(&name, &version)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("template {name}@{version} not found")))?;
    Ok(Json(template.into()))
}

async fn put_template(
    State(state): State<AppState>,
    Json(req): Json<PutTemplateRequest>,
) -> Result<Json<TemplateResponse>> {
    templates::validate(&req.body, &req.variables)?;
    let template = crate::model::PipelineTemplate::from(req);
    state.store.put_template(template.clone()).await?;
    Ok(Json(template.into()))
}

async fn validate_template(
    Json(req): Json<ValidateTemplateRequest>,
) -> Json<ValidateTemplateResponse> {
    match templates::validate(&req.body, &req.variables) {
        Ok(()) => Json(ValidateTemplateResponse { valid: true, error: None }),
        Err(e) => Json(ValidateTemplateResponse { valid: false, error: Some(e.to_string()) }),
    }
}

/// Deploys a rendered pipeline to a single host outside any experiment —
/// for manual comparison runs or smoke-testing a template change.
async fn create_adhoc_deployment(
    State(state): State<AppState>,
    Json(req): Json<AdhocDeployRequest>,
) -> Result<Json<DeploymentResponse>> {
    let template = state
        .store
        .get_template(&req.template.name, &req.template.version)
        .await?
        .ok_or_else(|| {
            PhoenixError::Validation(format!(
                "unknown template {}@{}",
                req.template.name, req.template.version
            ))
        })?;
    let host_id = HostId::from(req.host_id);
    let context = RenderContext {
        experiment_id: "adhoc".into(),
        variant: req.variant.to_string(),
        host_id: host_id.to_string(),
        metrics_sink_addr: state.config.metrics_sink_addr.clone(),
    };
    let rendered = templates::render(&template, &req.variables, &context)?;
    let now = Utc::now();
    let deployment = PipelineDeployment {
        id: DeploymentId::new(),
        experiment_id: crate::model::ExperimentId::new(),
        variant: req.variant,
        host_id: host_id.clone(),
        template: req.template,
        rendered_config_hash: rendered.hash,
        status: DeploymentStatus::Pending,
        metrics: DeploymentMetrics::default(),
        last_status_message: None,
        created_at: now,
        updated_at: now,
    };
    state.store.create_deployment(deployment.clone()).await?;
    state
        .queue
        .enqueue(crate::model::Task::new(
            host_id,
            None,
            crate::model::TaskType::Collector,
            crate::model::TaskAction::Start,
            serde_json::json!({
                "deployment_id": deployment.id.to_string(),
                "variant": deployment.variant,
                "config": rendered.text,
                "config_hash": deployment.rendered_config_hash,
            }),
            0,
        ))
        .await?;
    Ok(Json(deployment.into()))
}

async fn list_deployments(
    State(_state): State<AppState>,
) -> Result<Json<Vec<DeploymentResponse>>> {
    // Ad-hoc deployments aren't attached to an experiment, and the store
    // only indexes deployments per-experiment; this endpoint always
    // returns an empty catalog until a store-level "list all" is added.
    Ok(Json(Vec::new()))
}

async fn stop_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentResponse>> {
    let id: DeploymentId = id
        .parse()
        .map_err(|_| PhoenixError::Validation(format!("invalid deployment id: {id}")))?;
    let deployment = state
        .store
        .get_deployment(&id)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("deployment {id} not found")))?;
    state
        .queue
        .enqueue(crate::model::Task::new(
            deployment.host_id.clone(),
            Some(deployment.experiment_id),
            crate::model::TaskType::Collector,
            crate::model::TaskAction::Stop,
            serde_json::json!({ "deployment_id": deployment.id.to_string() }),
            10,
        ))
        .await?;
    state
        .store
        .update_deployment_status(&id, DeploymentStatus::Stopping, None)
        .await?;
    let deployment = state
        .store
        .get_deployment(&id)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("deployment {id} not found")))?;
    Ok(Json(deployment.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn list_templates_includes_builtins_once_seeded() {
        let state = AppState::new(ServerConfig::default());
        for t in crate::templates::builtin::all_templates() {
            state.store.put_template(t).await.unwrap();
        }
        let router = routes().with_state(state);
        let response = router
            .oneshot(
                axum::http::Request::get("/templates")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn validate_rejects_body_referencing_undeclared_variable() {
        let router = routes().with_state(AppState::new(ServerConfig::default()));
        let body = serde_json::to_vec(&serde_json::json!({
            "body": "receivers:\n  hostmetrics: {}\nexporters:\n  otlp:\n    endpoint: {{NOT_DECLARED}}\nservice:\n  pipelines:\n    metrics:\n      receivers: [hostmetrics]\n      exporters: [otlp]\n",
            "variables": []
        }))
        .unwrap();
        let response = router
            .oneshot(
                axum::http::Request::post("/validate")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ValidateTemplateResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!parsed.valid);
    }
}
