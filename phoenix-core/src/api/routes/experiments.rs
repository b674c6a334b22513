//! Experiment lifecycle: create, list, read, start/stop/rollback,
//! timeline, and the unified KPI result.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use crate::api::state::AppState;
use crate::api::types::{
    CreateExperimentRequest, EventResponse, ExperimentResponse, ListEventsQuery,
    ListExperimentsQuery,
};
use crate::error::{PhoenixError, Result};
use crate::model::{EventKind, Experiment, ExperimentId, ExperimentPhase, HostId, TemplateRef};
use crate::store::ExperimentFilter;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_experiment).get(list_experiments))
        .route("/:id", get(get_experiment))
        .route("/:id/start", post(start_experiment))
        .route("/:id/stop", post(stop_experiment))
        .route("/:id/rollback", post(rollback_experiment))
        .route("/:id/metrics", get(get_metrics))
        .route("/:id/events", get(list_events))
}

fn parse_id(raw: &str) -> Result<ExperimentId> {
    raw.parse()
        .map_err(|_| PhoenixError::Validation(format!("invalid experiment id: {raw}")))
}

async fn create_experiment(
    State(state): State<AppState>,
    Json(req): Json<CreateExperimentRequest>,
) -> Result<Json<ExperimentResponse>> {
    if req.target_hosts.is_empty() {
        return Err(PhoenixError::Validation("target_hosts must not be empty".into()));
    }
    if req.duration_secs <= 0 {
        return Err(PhoenixError::Validation("duration_secs must be positive".into()));
    }
    let now = Utc::now();
    let experiment = Experiment {
        id: ExperimentId::new(),
        name: req.name,
        description: req.description,
        baseline_template: req.baseline_template,
        baseline_variables: req.baseline_variables,
        candidate_template: req.candidate_template,
        candidate_variables: req.candidate_variables,
        target_hosts: req.target_hosts.into_iter().map(HostId::from).collect(),
        load_profile: req.load_profile,
        duration: chrono::Duration::seconds(req.duration_secs),
        phase: ExperimentPhase::Created,
        created_at: now,
        updated_at: now,
        started_at: None,
        stopped_at: None,
        completed_at: None,
        failure_reason: None,
        triggering_task: None,
        results: None,
        deleted_at: None,
    };
    if !experiment.variants_distinct() {
        return Err(PhoenixError::Validation(
            "baseline and candidate must differ in template or variables".into(),
        ));
    }
    state.store.create_experiment(experiment.clone()).await?;
    state.controller.emit(
        experiment.id,
        EventKind::ExperimentCreated,
        Some(ExperimentPhase::Created),
        "experiment created",
    );
    Ok(Json(experiment.into()))
}

async fn list_experiments(
    State(state): State<AppState>,
    Query(query): Query<ListExperimentsQuery>,
) -> Result<Json<Vec<ExperimentResponse>>> {
    let filter = ExperimentFilter {
        phase: query.phase,
        include_deleted: false,
    };
    let experiments = state.store.list_experiments(filter).await?;
    Ok(Json(experiments.into_iter().map(Into::into).collect()))
}

async fn get_experiment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentResponse>> {
    let id = parse_id(&id)?;
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;
    Ok(Json(experiment.into()))
}

async fn start_experiment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentResponse>> {
    let id = parse_id(&id)?;
    state.controller.start_experiment(&id).await?;
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;
    Ok(Json(experiment.into()))
}

async fn stop_experiment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentResponse>> {
    let id = parse_id(&id)?;
    state.controller.stop_experiment(&id).await?;
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;
    Ok(Json(experiment.into()))
}

async fn rollback_experiment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentResponse>> {
    let id = parse_id(&id)?;
    state.controller.rollback_experiment(&id).await?;
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;
    Ok(Json(experiment.into()))
}

async fn get_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<crate::analyzer::KpiResult>>> {
    let id = parse_id(&id)?;
    let experiment = state
        .store
        .get_experiment(&id)
        .await?
        .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;
    Ok(Json(experiment.results))
}

async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<EventResponse>>> {
    let id = parse_id(&id)?;
    let events = state.store.list_events(&id, query.since).await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}
