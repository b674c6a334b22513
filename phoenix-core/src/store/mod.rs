//! The Store: single source of truth for experiments,
//! deployments, tasks, agents, and events.
//!
//! `Store` is the trait-object seam, same shape as the teacher's
//! `MetadataStore`: an in-memory implementation (`memory`) backs tests
//! and the default runtime, a PostgreSQL implementation (`postgres`,
//! feature-gated) backs production. Every mutating operation that
//! depends on a read-modify-write (claim, phase transition, task
//! report) is documented as atomic; the in-memory store achieves this
//! with a single `tokio::sync::Mutex` guarding all tables, the
//! Postgres store with an explicit transaction per call.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::{PhoenixError, Result};
use crate::model::{
    AgentRecord, ExperimentEvent, ExperimentId, ExperimentPhase, HostId, PipelineDeployment,
    PipelineTemplate, Task, TaskId, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub phase: Option<ExperimentPhase>,
    pub include_deleted: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- Experiments ---------------------------------------------------
    async fn create_experiment(&self, experiment: crate::model::Experiment) -> Result<()>;
    async fn get_experiment(&self, id: &ExperimentId) -> Result<Option<crate::model::Experiment>>;
    async fn list_experiments(&self, filter: ExperimentFilter) -> Result<Vec<crate::model::Experiment>>;
    /// Update an experiment in place via a closure, under the store's lock.
    /// Used for fields other than `phase` (results, timestamps).
    async fn update_experiment(
        &self,
        id: &ExperimentId,
        f: Box<dyn FnOnce(&mut crate::model::Experiment) + Send>,
    ) -> Result<()>;
    /// Compare-and-set phase transition: fails with
    /// `Conflict` if the experiment's current phase is not `from`.
    async fn transition_experiment_phase(
        &self,
        id: &ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<()>;
    async fn soft_delete_experiment(&self, id: &ExperimentId) -> Result<()>;

    // -- Deployments ----------------------------------------------------
    async fn create_deployment(&self, deployment: PipelineDeployment) -> Result<()>;
    async fn get_deployment(&self, id: &crate::model::DeploymentId) -> Result<Option<PipelineDeployment>>;
    async fn list_deployments_for_experiment(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<PipelineDeployment>>;
    async fn update_deployment_status(
        &self,
        id: &crate::model::DeploymentId,
        status: crate::model::DeploymentStatus,
        message: Option<String>,
    ) -> Result<()>;

    // -- Tasks / Queue ----------------------------------------------------
    async fn enqueue_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;
    /// Atomic claim: the only path from `pending` to
    /// `assigned`. Ordering within a host is (priority desc, created_at
    /// asc), ties broken by id.
    async fn claim_next_tasks(
        &self,
        host_id: &HostId,
        capabilities: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>>;
    async fn report_task(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task>;
    /// Tasks stuck past their per-type timeout, for the sweeper.
    async fn list_stale_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;
    async fn requeue_task(&self, id: &TaskId, now: DateTime<Utc>) -> Result<()>;
    async fn fail_task(&self, id: &TaskId, reason: &str, now: DateTime<Utc>) -> Result<()>;
    async fn list_tasks_for_experiment(&self, experiment_id: &ExperimentId) -> Result<Vec<Task>>;

    // -- Agents -----------------------------------------------------------
    async fn upsert_agent(&self, record: AgentRecord) -> Result<()>;
    async fn get_agent(&self, host_id: &HostId) -> Result<Option<AgentRecord>>;
    async fn list_agents(&self) -> Result<Vec<AgentRecord>>;

    // -- Events ------------------------------------------------------------
    async fn append_event(&self, event: ExperimentEvent) -> Result<()>;
    async fn list_events(&self, experiment_id: &ExperimentId, since: Option<DateTime<Utc>>) -> Result<Vec<ExperimentEvent>>;

    // -- Templates ----------------------------------------------------------
    async fn get_template(&self, name: &str, version: &str) -> Result<Option<PipelineTemplate>>;
    async fn list_templates(&self) -> Result<Vec<PipelineTemplate>>;
    async fn put_template(&self, template: PipelineTemplate) -> Result<()>;
}

pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> PhoenixError {
    PhoenixError::NotFound(format!("{what} {id} not found"))
}
