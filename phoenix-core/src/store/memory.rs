//! In-memory `Store`, the default runtime backend and the
//! one exercised by every test in this crate. Mirrors the teacher's
//! `InMemoryMetadataStore`: one `tokio::sync::RwLock<HashMap<..>>` per
//! table, `Arc`-free (the store itself is wrapped in `Arc<dyn Store>`
//! by callers).

use super::{not_found, ExperimentFilter, Store};
use crate::error::{PhoenixError, Result};
use crate::model::{
    AgentRecord, DeploymentId, DeploymentStatus, Experiment, ExperimentEvent, ExperimentId,
    ExperimentPhase, HostId, PipelineDeployment, PipelineTemplate, Task, TaskId, TaskStatus,
    TaskType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The capability tag a task's type requires of a polling agent. Not
/// modeled as a field on `Task`; derived from `task_type` since
/// collector/loadsim/command tasks map 1:1 onto agent capability tags
/// in practice.
fn required_capability(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Collector => "collector",
        TaskType::Loadsim => "loadsim",
        TaskType::Command => "command",
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    experiments: RwLock<HashMap<ExperimentId, Experiment>>,
    deployments: RwLock<HashMap<DeploymentId, PipelineDeployment>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    agents: RwLock<HashMap<HostId, AgentRecord>>,
    events: RwLock<HashMap<ExperimentId, Vec<ExperimentEvent>>>,
    templates: RwLock<HashMap<(String, String), PipelineTemplate>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_experiment(&self, experiment: Experiment) -> Result<()> {
        let mut experiments = self.experiments.write().await;
        if experiments.contains_key(&experiment.id) {
            return Err(PhoenixError::Conflict(format!(
                "experiment {} already exists",
                experiment.id
            )));
        }
        experiments.insert(experiment.id, experiment);
        Ok(())
    }

    async fn get_experiment(&self, id: &ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.experiments.read().await.get(id).cloned())
    }

    async fn list_experiments(&self, filter: ExperimentFilter) -> Result<Vec<Experiment>> {
        let experiments = self.experiments.read().await;
        let mut out: Vec<Experiment> = experiments
            .values()
            .filter(|e| filter.include_deleted || e.deleted_at.is_none())
            .filter(|e| filter.phase.map(|p| p == e.phase).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_experiment(
        &self,
        id: &ExperimentId,
        f: Box<dyn FnOnce(&mut Experiment) + Send>,
    ) -> Result<()> {
        let mut experiments = self.experiments.write().await;
        let experiment = experiments
            .get_mut(id)
            .ok_or_else(|| not_found("experiment", id))?;
        f(experiment);
        experiment.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_experiment_phase(
        &self,
        id: &ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<()> {
        let mut experiments = self.experiments.write().await;
        let experiment = experiments
            .get_mut(id)
            .ok_or_else(|| not_found("experiment", id))?;
        if experiment.phase == to {
            // Terminal writes are idempotent.
            return Ok(());
        }
        if experiment.phase != from {
            return Err(PhoenixError::Conflict(format!(
                "experiment {id} is in phase {:?}, expected {:?}",
                experiment.phase, from
            )));
        }
        if !from.can_transition_to(to) {
            return Err(PhoenixError::Conflict(format!(
                "illegal phase transition {:?} -> {:?}",
                from, to
            )));
        }
        experiment.phase = to;
        experiment.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_experiment(&self, id: &ExperimentId) -> Result<()> {
        let mut experiments = self.experiments.write().await;
        let experiment = experiments
            .get_mut(id)
            .ok_or_else(|| not_found("experiment", id))?;
        experiment.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn create_deployment(&self, deployment: PipelineDeployment) -> Result<()> {
        self.deployments.write().await.insert(deployment.id, deployment);
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<PipelineDeployment>> {
        Ok(self.deployments.read().await.get(id).cloned())
    }

    async fn list_deployments_for_experiment(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<PipelineDeployment>> {
        let deployments = self.deployments.read().await;
        let mut out: Vec<PipelineDeployment> = deployments
            .values()
            .filter(|d| &d.experiment_id == experiment_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Result<()> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments.get_mut(id).ok_or_else(|| not_found("deployment", id))?;
        deployment.status = status;
        if message.is_some() {
            deployment.last_status_message = message;
        }
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn enqueue_task(&self, task: Task) -> Result<()> {
        self.tasks.write().await.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn claim_next_tasks(
        &self,
        host_id: &HostId,
        capabilities: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let mut tasks = self.tasks.write().await;
        let mut candidates: Vec<TaskId> = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && &t.host_id == host_id
                    && capabilities
                        .iter()
                        .any(|c| c == required_capability(t.task_type))
            })
            .map(|t| t.id)
            .collect();

        candidates.sort_by(|a, b| {
            let ta = &tasks[a];
            let tb = &tasks[b];
            tb.priority
                .cmp(&ta.priority)
                .then(ta.created_at.cmp(&tb.created_at))
                .then(ta.id.0.cmp(&tb.id.0))
        });
        candidates.truncate(max_tasks);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let task = tasks.get_mut(&id).expect("candidate id exists");
            task.status = TaskStatus::Assigned;
            task.assigned_at = Some(now);
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn report_task(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| not_found("task", id))?;
        if task.status == status {
            return Ok(task.clone());
        }
        if !task.status.can_transition_to(status) {
            return Err(PhoenixError::Conflict(format!(
                "task {id} cannot move from {:?} to {:?}",
                task.status, status
            )));
        }
        if status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }
        task.status = status;
        task.result = result;
        task.error = error;
        Ok(task.clone())
    }

    async fn list_stale_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
            .filter(|t| {
                let reference = t.assigned_at.or(t.started_at).unwrap_or(t.created_at);
                let loadsim_duration = t
                    .config
                    .get("duration_secs")
                    .and_then(|v| v.as_i64())
                    .map(chrono::Duration::seconds);
                now - reference > crate::model::stuck_timeout(t.task_type, loadsim_duration)
            })
            .cloned()
            .collect())
    }

    async fn requeue_task(&self, id: &TaskId, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| not_found("task", id))?;
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.assigned_at = None;
        task.started_at = None;
        let _ = now;
        Ok(())
    }

    async fn fail_task(&self, id: &TaskId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| not_found("task", id))?;
        task.status = TaskStatus::Failed;
        task.error = Some(reason.to_string());
        task.completed_at = Some(now);
        Ok(())
    }

    async fn list_tasks_for_experiment(&self, experiment_id: &ExperimentId) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| t.experiment_id.as_ref() == Some(experiment_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn upsert_agent(&self, record: AgentRecord) -> Result<()> {
        self.agents.write().await.insert(record.host_id.clone(), record);
        Ok(())
    }

    async fn get_agent(&self, host_id: &HostId) -> Result<Option<AgentRecord>> {
        Ok(self.agents.read().await.get(host_id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let agents = self.agents.read().await;
        let mut out: Vec<AgentRecord> = agents.values().cloned().collect();
        out.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        Ok(out)
    }

    async fn append_event(&self, event: ExperimentEvent) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.experiment_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_events(
        &self,
        experiment_id: &ExperimentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExperimentEvent>> {
        let events = self.events.read().await;
        let mut out: Vec<ExperimentEvent> = events
            .get(experiment_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|e| since.map(|s| e.created_at > s).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn get_template(&self, name: &str, version: &str) -> Result<Option<PipelineTemplate>> {
        Ok(self
            .templates
            .read()
            .await
            .get(&(name.to_string(), version.to_string()))
            .cloned())
    }

    async fn list_templates(&self) -> Result<Vec<PipelineTemplate>> {
        let templates = self.templates.read().await;
        let mut out: Vec<PipelineTemplate> = templates.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(out)
    }

    async fn put_template(&self, template: PipelineTemplate) -> Result<()> {
        self.templates
            .write()
            .await
            .insert((template.name.clone(), template.version.clone()), template);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, TaskAction};

    fn task(host: &str, priority: i32) -> Task {
        Task::new(
            HostId::from(host),
            None,
            TaskType::Collector,
            TaskAction::Start,
            serde_json::json!({}),
            priority,
        )
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_respects_priority_then_fifo() {
        let store = InMemoryStore::new();
        let low = task("h1", 1);
        let high = task("h1", 10);
        store.enqueue_task(low.clone()).await.unwrap();
        store.enqueue_task(high.clone()).await.unwrap();

        let caps = vec!["collector".to_string()];
        let claimed = store
            .claim_next_tasks(&HostId::from("h1"), &caps, 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[1].id, low.id);

        let again = store
            .claim_next_tasks(&HostId::from("h1"), &caps, 10, Utc::now())
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_ignores_tasks_for_other_hosts_and_missing_capabilities() {
        let store = InMemoryStore::new();
        store.enqueue_task(task("h1", 1)).await.unwrap();
        let claimed = store
            .claim_next_tasks(&HostId::from("h2"), &["collector".to_string()], 10, Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = store
            .claim_next_tasks(&HostId::from("h1"), &["loadsim".to_string()], 10, Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn report_task_rejects_illegal_regression() {
        let store = InMemoryStore::new();
        let t = task("h1", 1);
        store.enqueue_task(t.clone()).await.unwrap();
        store
            .report_task(&t.id, TaskStatus::Completed, None, None, Utc::now())
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn phase_transition_is_compare_and_set() {
        let store = InMemoryStore::new();
        let exp = crate::model::test_support::sample_experiment();
        let id = exp.id;
        store.create_experiment(exp).await.unwrap();
        store
            .transition_experiment_phase(&id, ExperimentPhase::Created, ExperimentPhase::Deploying)
            .await
            .unwrap();
        let err = store
            .transition_experiment_phase(&id, ExperimentPhase::Created, ExperimentPhase::Deploying)
            .await
            .unwrap_err();
        assert!(matches!(err, PhoenixError::Conflict(_)));
    }

    #[tokio::test]
    async fn terminal_phase_write_is_idempotent() {
        let store = InMemoryStore::new();
        let mut exp = crate::model::test_support::sample_experiment();
        exp.phase = ExperimentPhase::Running;
        let id = exp.id;
        store.create_experiment(exp).await.unwrap();
        store
            .transition_experiment_phase(&id, ExperimentPhase::Running, ExperimentPhase::Stopped)
            .await
            .unwrap();
        store
            .transition_experiment_phase(&id, ExperimentPhase::Running, ExperimentPhase::Stopped)
            .await
            .unwrap();
    }
}
