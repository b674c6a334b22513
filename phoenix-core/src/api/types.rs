//! Request/response DTOs for the operator- and agent-facing HTTP surface.
//!
//! Opaque ids cross the wire as plain strings (`ExperimentId`/`TaskId`/
//! etc. already serialize transparently as their inner UUID), durations
//! as whole seconds rather than ISO 8601 — simpler to hand-author in
//! curl/Postman, and the only consumers are the bundled agent and the
//! operator CLI, not third parties.

use crate::model::{
    DeploymentStatus, Experiment, ExperimentPhase, HostId, PipelineTemplate, Task, TaskStatus,
    TemplateRef, Variant,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub baseline_template: TemplateRef,
    #[serde(default)]
    pub baseline_variables: HashMap<String, serde_json::Value>,
    pub candidate_template: TemplateRef,
    #[serde(default)]
    pub candidate_variables: HashMap<String, serde_json::Value>,
    pub target_hosts: Vec<String>,
    #[serde(default)]
    pub load_profile: Option<String>,
    /// Seconds the experiment stays `running` before analysis starts.
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub baseline_template: TemplateRef,
    pub candidate_template: TemplateRef,
    pub target_hosts: Vec<String>,
    pub phase: ExperimentPhase,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub failure_reason: Option<String>,
    pub results: Option<crate::analyzer::KpiResult>,
}

impl From<Experiment> for ExperimentResponse {
    fn from(e: Experiment) -> Self {
        Self {
            id: e.id.to_string(),
            name: e.name,
            description: e.description,
            baseline_template: e.baseline_template,
            candidate_template: e.candidate_template,
            target_hosts: e.target_hosts.into_iter().map(|h| h.0).collect(),
            phase: e.phase,
            created_at: e.created_at,
            updated_at: e.updated_at,
            started_at: e.started_at,
            completed_at: e.completed_at,
            failure_reason: e.failure_reason.map(|r| r.to_string()),
            results: e.results,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ListExperimentsQuery {
    pub phase: Option<ExperimentPhase>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventResponse {
    pub id: String,
    pub experiment_id: String,
    pub kind: String,
    pub phase: Option<ExperimentPhase>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<crate::model::ExperimentEvent> for EventResponse {
    fn from(e: crate::model::ExperimentEvent) -> Self {
        Self {
            id: e.id.to_string(),
            experiment_id: e.experiment_id.to_string(),
            kind: e.kind.to_string(),
            phase: e.phase,
            message: e.message,
            metadata: e.metadata,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ListEventsQuery {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResponse {
    pub id: String,
    pub experiment_id: String,
    pub variant: Variant,
    pub host_id: String,
    pub template: TemplateRef,
    pub rendered_config_hash: String,
    pub status: DeploymentStatus,
    pub last_status_message: Option<String>,
}

impl From<crate::model::PipelineDeployment> for DeploymentResponse {
    fn from(d: crate::model::PipelineDeployment) -> Self {
        Self {
            id: d.id.to_string(),
            experiment_id: d.experiment_id.to_string(),
            variant: d.variant,
            host_id: d.host_id.0,
            template: d.template,
            rendered_config_hash: d.rendered_config_hash,
            status: d.status,
            last_status_message: d.last_status_message,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ValidateTemplateRequest {
    pub body: String,
    #[serde(default)]
    pub variables: Vec<crate::model::VariableSchema>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateTemplateResponse {
    pub valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PutTemplateRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub body: String,
    #[serde(default)]
    pub variables: Vec<crate::model::VariableSchema>,
}

impl From<PutTemplateRequest> for PipelineTemplate {
    fn from(r: PutTemplateRequest) -> Self {
        Self {
            name: r.name,
            version: r.version,
            description: r.description,
            body: r.body,
            variables: r.variables,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateResponse {
    pub name: String,
    pub version: String,
    pub description: String,
    pub variables: Vec<crate::model::VariableSchema>,
}

impl From<PipelineTemplate> for TemplateResponse {
    fn from(t: PipelineTemplate) -> Self {
        Self {
            name: t.name,
            version: t.version,
            description: t.description,
            variables: t.variables,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdhocDeployRequest {
    pub host_id: String,
    pub variant: Variant,
    pub template: TemplateRef,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

// ============================================================================
// Agent protocol
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct PollTasksQuery {
    /// Long-poll budget in seconds; clamped to the server's configured max.
    pub max_wait_secs: Option<u64>,
    pub max_tasks: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub experiment_id: Option<String>,
    pub task_type: crate::model::TaskType,
    pub action: crate::model::TaskAction,
    pub config: serde_json::Value,
    pub priority: i32,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self {
            id: t.id.to_string(),
            experiment_id: t.experiment_id.map(|id| id.to_string()),
            task_type: t.task_type,
            action: t.action,
            config: t.config,
            priority: t.priority,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportTaskStatusRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
    pub address: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub active_task_ids: Vec<String>,
    #[serde(default)]
    pub resource_usage: crate::model::ResourceUsage,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub host_id: String,
    pub health: crate::model::AgentHealth,
}

#[derive(Debug, Deserialize)]
pub struct AgentMetricsRequest {
    #[serde(default)]
    pub gauges: HashMap<String, f64>,
}

/// Parses the `X-Agent-Host-ID` header into a `HostId`, the only
/// identity and authorization an agent carries in this deployment.
pub fn parse_host_header(value: Option<&str>) -> Option<HostId> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(HostId::from)
}
