//! Experiment Controller: drives experiments through their
//! phases and translates phase changes into queue activity.
//!
//! Structured like the teacher's background reconciliation loop: a
//! `Controller` holds the shared collaborators (`Store`, `TaskQueue`,
//! `EventHub`, analyzer), exposes operator-triggered transitions as
//! plain async methods, and a `run_ticker` loop drives the
//! time-based transitions (duration elapsed, grace window expiry)
//! on a fixed interval.

use crate::analyzer::AnalysisRunner;
use crate::config::ServerConfig;
use crate::error::{PhoenixError, Result};
use crate::model::{
    DeploymentStatus, EventId, EventKind, Experiment, ExperimentEvent, ExperimentId,
    ExperimentPhase, FailureReason, HostId, PipelineDeployment, Task, TaskAction, TaskType,
    Variant,
};
use crate::store::{ExperimentFilter, Store};
use crate::templates::{self, RenderContext};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Controller {
    store: Arc<dyn Store>,
    queue: Arc<crate::queue::TaskQueue>,
    hub: Arc<crate::hub::EventHub>,
    analyzer: Arc<dyn AnalysisRunner>,
    config: ServerConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<crate::queue::TaskQueue>,
        hub: Arc<crate::hub::EventHub>,
        analyzer: Arc<dyn AnalysisRunner>,
        config: ServerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            hub,
            analyzer,
            config,
        }
    }

    /// Persists and fans out a lifecycle event. `pub(crate)` so the API
    /// layer can emit `experiment_created` at creation time, before the
    /// experiment enters the controller's own transitions.
    pub(crate) fn emit(&self, experiment_id: ExperimentId, kind: EventKind, phase: Option<ExperimentPhase>, message: impl Into<String>) {
        let event = ExperimentEvent {
            id: EventId::new(),
            experiment_id,
            kind,
            phase,
            message: message.into(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        let topic = crate::hub::EventHub::topic_for(&experiment_id);
        let store = self.store.clone();
        let hub = self.hub.clone();
        let event_for_store = event.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append_event(event_for_store).await {
                tracing::warn!(error = %e, "failed to persist experiment event");
            }
        });
        hub.publish(&topic, event);
    }

    /// `created -> deploying`: render each (host, variant)
    /// template, persist a pending deployment, enqueue a
    /// `collector/start` task. Partial-failure fanout: if any enqueue
    /// fails, already-enqueued tasks for this transition are cancelled
    /// and the experiment is marked failed with `fanout_aborted` rather
    /// than left half-deployed.
    pub async fn start_experiment(&self, id: &ExperimentId) -> Result<()> {
        let experiment = self
            .store
            .get_experiment(id)
            .await?
            .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;

        if !experiment.variants_distinct() {
            return Err(PhoenixError::Validation(
                "baseline and candidate must differ in template or variables".into(),
            ));
        }

        self.store
            .transition_experiment_phase(id, ExperimentPhase::Created, ExperimentPhase::Deploying)
            .await?;

        let mut enqueued: Vec<Task> = Vec::new();
        for host in &experiment.target_hosts {
            for variant in [Variant::Baseline, Variant::Candidate] {
                match self.fanout_one(&experiment, host, variant).await {
                    Ok(task) => enqueued.push(task),
                    Err(e) => {
                        tracing::warn!(experiment_id = %id, error = %e, "fanout failed, aborting");
                        for task in &enqueued {
                            let _ = self
                                .store
                                .fail_task(&task.id, "fanout_aborted", Utc::now())
                                .await;
                        }
                        self.store
                            .update_experiment(
                                id,
                                Box::new(move |e: &mut Experiment| {
                                    e.failure_reason = Some(FailureReason::FanoutAborted);
                                }),
                            )
                            .await?;
                        let _ = self
                            .store
                            .transition_experiment_phase(id, ExperimentPhase::Deploying, ExperimentPhase::Failed)
                            .await;
                        self.emit(*id, EventKind::ExperimentFailed, Some(ExperimentPhase::Failed), "fanout aborted");
                        return Err(e);
                    }
                }
            }
        }

        self.emit(*id, EventKind::ExperimentPhaseChanged, Some(ExperimentPhase::Deploying), "deploying");
        Ok(())
    }

    async fn fanout_one(
        &self,
        experiment: &Experiment,
        host: &HostId,
        variant: Variant,
    ) -> Result<Task> {
        let (template_ref, variables) = match variant {
            Variant::Baseline => (&experiment.baseline_template, &experiment.baseline_variables),
            Variant::Candidate => (&experiment.candidate_template, &experiment.candidate_variables),
        };
        let template = self
            .store
            .get_template(&template_ref.name, &template_ref.version)
            .await?
            .ok_or_else(|| PhoenixError::Validation(format!("unknown template {template_ref}")))?;

        let ctx = RenderContext {
            experiment_id: experiment.id.to_string(),
            variant: variant.to_string(),
            host_id: host.to_string(),
            metrics_sink_addr: self.config.metrics_sink_addr.clone(),
        };
        let rendered = templates::render(&template, variables, &ctx)?;

        let deployment = PipelineDeployment {
            id: crate::model::DeploymentId::new(),
            experiment_id: experiment.id,
            variant,
            host_id: host.clone(),
            template: template_ref.clone(),
            rendered_config_hash: rendered.hash.clone(),
            status: DeploymentStatus::Pending,
            metrics: Default::default(),
            last_status_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create_deployment(deployment.clone()).await?;

        let task = Task::new(
            host.clone(),
            Some(experiment.id),
            TaskType::Collector,
            TaskAction::Start,
            serde_json::json!({
                "deployment_id": deployment.id.to_string(),
                "variant": variant.to_string(),
                "config": rendered.text,
                "config_hash": rendered.hash,
            }),
            0,
        );
        self.queue.enqueue(task.clone()).await?;
        Ok(task)
    }

    /// Called when a deployment's status changes (agent-reported).
    /// Implements the `deploying -> running` transition once all
    /// deployments of the experiment are live, and the
    /// deployment-entering-`failed`-while-`deploying` poisoning rule.
    pub async fn on_deployment_status(
        &self,
        deployment_id: &crate::model::DeploymentId,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Result<()> {
        self.store
            .update_deployment_status(deployment_id, status, message)
            .await?;
        let deployment = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| PhoenixError::NotFound(format!("deployment {deployment_id} not found")))?;
        let experiment_id = deployment.experiment_id;
        let experiment = self
            .store
            .get_experiment(&experiment_id)
            .await?
            .ok_or_else(|| PhoenixError::NotFound(format!("experiment {experiment_id} not found")))?;

        // An operator stop is in flight: hold the phase until every
        // deployment has acked terminal, then finalize (spec §4.4/S2 —
        // "stopped ... within a few seconds after all hosts ack").
        if experiment.failure_reason == Some(FailureReason::OperatorStop) && !experiment.phase.is_terminal() {
            let deployments = self.store.list_deployments_for_experiment(&experiment_id).await?;
            if deployments.iter().all(|d| d.status.is_terminal()) {
                self.finalize_stop(&experiment_id, experiment.phase).await?;
                return Ok(());
            }
            self.emit(
                experiment_id,
                EventKind::DeploymentStatusChanged,
                None,
                format!("deployment {deployment_id} -> {status}"),
            );
            return Ok(());
        }

        if experiment.phase != ExperimentPhase::Deploying {
            self.emit(
                experiment_id,
                EventKind::DeploymentStatusChanged,
                None,
                format!("deployment {deployment_id} -> {status}"),
            );
            return Ok(());
        }

        if status == DeploymentStatus::Failed {
            self.poison_deploying_experiment(&experiment_id).await?;
            return Ok(());
        }

        let deployments = self.store.list_deployments_for_experiment(&experiment_id).await?;
        if !deployments.is_empty() && deployments.iter().all(|d| d.status.is_live()) {
            self.store
                .transition_experiment_phase(&experiment_id, ExperimentPhase::Deploying, ExperimentPhase::Running)
                .await?;
            self.store
                .update_experiment(
                    &experiment_id,
                    Box::new(|e: &mut Experiment| e.started_at = Some(Utc::now())),
                )
                .await?;
            self.emit(experiment_id, EventKind::ExperimentStarted, Some(ExperimentPhase::Running), "running");
        }
        self.emit(
            experiment_id,
            EventKind::DeploymentStatusChanged,
            None,
            format!("deployment {deployment_id} -> {status}"),
        );
        Ok(())
    }

    async fn poison_deploying_experiment(&self, experiment_id: &ExperimentId) -> Result<()> {
        let deployments = self.store.list_deployments_for_experiment(experiment_id).await?;
        for deployment in deployments.iter().filter(|d| d.status.is_live()) {
            self.enqueue_stop(experiment_id, deployment).await?;
        }
        self.store
            .update_experiment(
                experiment_id,
                Box::new(|e: &mut Experiment| e.failure_reason = Some(FailureReason::DeploymentFailed)),
            )
            .await?;
        let _ = self
            .store
            .transition_experiment_phase(experiment_id, ExperimentPhase::Deploying, ExperimentPhase::Failed)
            .await;
        self.emit(*experiment_id, EventKind::ExperimentFailed, Some(ExperimentPhase::Failed), "deployment failed");
        Ok(())
    }

    async fn enqueue_stop(&self, experiment_id: &ExperimentId, deployment: &PipelineDeployment) -> Result<()> {
        let task = Task::new(
            deployment.host_id.clone(),
            Some(*experiment_id),
            TaskType::Collector,
            TaskAction::Stop,
            serde_json::json!({ "deployment_id": deployment.id.to_string() }),
            10,
        );
        self.queue.enqueue(task).await
    }

    /// Operator stop: enqueue `collector/stop` for every
    /// live deployment; transition to `stopped` once all are terminal.
    pub async fn stop_experiment(&self, id: &ExperimentId) -> Result<()> {
        let experiment = self
            .store
            .get_experiment(id)
            .await?
            .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;
        if experiment.phase.is_terminal() {
            return Err(PhoenixError::Conflict(format!("experiment {id} is already terminal")));
        }
        let deployments = self.store.list_deployments_for_experiment(id).await?;
        let live: Vec<_> = deployments.iter().filter(|d| d.status.is_live()).collect();
        for deployment in &live {
            self.enqueue_stop(id, deployment).await?;
        }
        self.store
            .update_experiment(id, Box::new(|e: &mut Experiment| e.failure_reason = Some(FailureReason::OperatorStop)))
            .await?;
        if live.is_empty() {
            // Nothing to wait for — finalize immediately.
            self.finalize_stop(id, experiment.phase).await?;
        } else {
            self.emit(*id, EventKind::DeploymentStatusChanged, None, "stop requested, awaiting host acks");
        }
        Ok(())
    }

    /// Transitions an experiment to `stopped` and stamps `stopped_at`,
    /// once every deployment has acked terminal (or there was never
    /// anything to stop). Called from `stop_experiment` directly when
    /// there are no live deployments, and from `on_deployment_status`
    /// once the last live deployment reports terminal.
    async fn finalize_stop(&self, id: &ExperimentId, from: ExperimentPhase) -> Result<()> {
        self.store
            .update_experiment(id, Box::new(|e: &mut Experiment| e.stopped_at = Some(Utc::now())))
            .await?;
        self.store.transition_experiment_phase(id, from, ExperimentPhase::Stopped).await?;
        self.emit(*id, EventKind::ExperimentPhaseChanged, Some(ExperimentPhase::Stopped), "stopped by operator");
        Ok(())
    }

    /// Operator rollback: stop candidate-variant deployments
    /// only; baseline remains live.
    pub async fn rollback_experiment(&self, id: &ExperimentId) -> Result<()> {
        let experiment = self
            .store
            .get_experiment(id)
            .await?
            .ok_or_else(|| PhoenixError::NotFound(format!("experiment {id} not found")))?;
        if experiment.phase.is_terminal() {
            return Err(PhoenixError::Conflict(format!("experiment {id} is already terminal")));
        }
        let deployments = self.store.list_deployments_for_experiment(id).await?;
        for deployment in deployments
            .iter()
            .filter(|d| d.variant == Variant::Candidate && d.status.is_live())
        {
            self.enqueue_stop(id, deployment).await?;
        }
        self.store
            .update_experiment(id, Box::new(|e: &mut Experiment| e.failure_reason = Some(FailureReason::OperatorRollback)))
            .await?;
        self.store
            .transition_experiment_phase(id, experiment.phase, ExperimentPhase::RolledBack)
            .await?;
        self.emit(*id, EventKind::ExperimentPhaseChanged, Some(ExperimentPhase::RolledBack), "rolled back by operator");
        Ok(())
    }

    /// `running -> analyzing`: scheduled once
    /// `now - started_at >= duration`. Enqueues `collector/stop` for
    /// every deployment, then invokes the analyzer over the elapsed
    /// window and stores the result, transitioning to `completed`.
    async fn advance_running_experiment(&self, experiment: &Experiment) -> Result<()> {
        let started_at = match experiment.started_at {
            Some(t) => t,
            None => return Ok(()),
        };
        if Utc::now() - started_at < experiment.duration {
            return Ok(());
        }
        self.store
            .transition_experiment_phase(&experiment.id, ExperimentPhase::Running, ExperimentPhase::Analyzing)
            .await?;
        self.emit(experiment.id, EventKind::ExperimentPhaseChanged, Some(ExperimentPhase::Analyzing), "analyzing");

        let deployments = self.store.list_deployments_for_experiment(&experiment.id).await?;
        for deployment in deployments.iter().filter(|d| d.status.is_live()) {
            self.enqueue_stop(&experiment.id, deployment).await?;
        }

        let end = Utc::now();
        match self
            .analyzer
            .analyze(&experiment.id, started_at, end, &experiment.target_hosts)
            .await
        {
            Ok(kpi) => {
                self.store
                    .update_experiment(
                        &experiment.id,
                        Box::new(move |e: &mut Experiment| {
                            e.results = Some(kpi);
                            e.completed_at = Some(Utc::now());
                        }),
                    )
                    .await?;
                self.store
                    .transition_experiment_phase(&experiment.id, ExperimentPhase::Analyzing, ExperimentPhase::Completed)
                    .await?;
                self.emit(experiment.id, EventKind::KpiComputed, None, "kpi computed");
                self.emit(experiment.id, EventKind::ExperimentCompleted, Some(ExperimentPhase::Completed), "completed");
            }
            Err(e) => {
                tracing::warn!(experiment_id = %experiment.id, error = %e, "analysis failed");
                self.store
                    .update_experiment(
                        &experiment.id,
                        Box::new(|e: &mut Experiment| e.failure_reason = Some(FailureReason::AnalysisTimeout)),
                    )
                    .await?;
                let _ = self
                    .store
                    .transition_experiment_phase(&experiment.id, ExperimentPhase::Analyzing, ExperimentPhase::Failed)
                    .await;
                self.emit(experiment.id, EventKind::ExperimentFailed, Some(ExperimentPhase::Failed), "analysis failed");
            }
        }
        Ok(())
    }

    /// Hosts that go offline during `deploying` do not block
    /// indefinitely: after `deploy_grace_window` the experiment fails
    /// with `hosts_unreachable`.
    async fn check_deploy_grace_window(&self, experiment: &Experiment) -> Result<()> {
        if Utc::now() - experiment.created_at < chrono::Duration::from_std(self.config.deploy_grace_window).unwrap() {
            return Ok(());
        }
        let deployments = self.store.list_deployments_for_experiment(&experiment.id).await?;
        if deployments.iter().all(|d| d.status.is_live()) {
            return Ok(());
        }
        let agents = self.store.list_agents().await?;
        let by_host: HashMap<&HostId, &crate::model::AgentRecord> =
            agents.iter().map(|a| (&a.host_id, a)).collect();
        let any_unreachable = experiment.target_hosts.iter().any(|h| {
            by_host
                .get(h)
                .map(|a| crate::model::effective_health(a.health, a.last_heartbeat, Utc::now(), chrono::Duration::from_std(self.config.offline_after).unwrap()) == crate::model::AgentHealth::Offline)
                .unwrap_or(true)
        });
        if !any_unreachable {
            return Ok(());
        }
        for deployment in deployments.iter().filter(|d| d.status.is_live()) {
            self.enqueue_stop(&experiment.id, deployment).await?;
        }
        self.store
            .update_experiment(
                &experiment.id,
                Box::new(|e: &mut Experiment| e.failure_reason = Some(FailureReason::HostsUnreachable)),
            )
            .await?;
        let _ = self
            .store
            .transition_experiment_phase(&experiment.id, ExperimentPhase::Deploying, ExperimentPhase::Failed)
            .await;
        self.emit(experiment.id, EventKind::ExperimentFailed, Some(ExperimentPhase::Failed), "hosts unreachable");
        Ok(())
    }

    /// One iteration of the background driver: re-evaluate every
    /// non-terminal experiment for duration-elapsed and grace-window
    /// transitions, and sweep the queue for stuck tasks.
    pub async fn tick(&self) -> Result<()> {
        let experiments = self.store.list_experiments(ExperimentFilter::default()).await?;
        for experiment in experiments.iter().filter(|e| !e.phase.is_terminal()) {
            match experiment.phase {
                ExperimentPhase::Running => self.advance_running_experiment(experiment).await?,
                ExperimentPhase::Deploying => self.check_deploy_grace_window(experiment).await?,
                _ => {}
            }
        }
        let report = self.queue.sweep(self.config.max_retry_count).await?;
        if report.requeued > 0 || report.failed > 0 {
            tracing::debug!(requeued = report.requeued, failed = report.failed, "queue sweep");
        }
        Ok(())
    }

    /// Background ticker: calls `tick` on `config.controller_tick_interval`
    /// until cancelled. Intended to be spawned once at server startup.
    pub async fn run_ticker(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.controller_tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "controller tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, RecordingMetricsBackend};
    use crate::store::memory::InMemoryStore;

    fn controller() -> Controller {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue = Arc::new(crate::queue::TaskQueue::new(store.clone()));
        let hub = crate::hub::EventHub::new();
        let config = ServerConfig::default();
        let analyzer: Arc<dyn AnalysisRunner> = Arc::new(Analyzer::new(
            RecordingMetricsBackend::new(),
            config.cost_model,
            config.critical_process_names.clone(),
        ));
        Controller::new(store, queue, hub, analyzer, config)
    }

    async fn seed_templates(store: &Arc<dyn Store>) {
        for t in crate::templates::builtin::all_templates() {
            store.put_template(t).await.unwrap();
        }
    }

    #[tokio::test]
    async fn start_experiment_enqueues_one_task_per_host_variant() {
        let c = controller();
        seed_templates(&c.store).await;
        let experiment = crate::model::test_support::sample_experiment();
        let id = experiment.id;
        c.store.create_experiment(experiment).await.unwrap();
        c.start_experiment(&id).await.unwrap();

        let tasks = c.store.list_tasks_for_experiment(&id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        let exp = c.store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Deploying);
    }

    #[tokio::test]
    async fn start_rejects_identical_baseline_and_candidate() {
        let c = controller();
        seed_templates(&c.store).await;
        let mut experiment = crate::model::test_support::sample_experiment();
        experiment.candidate_template = experiment.baseline_template.clone();
        experiment.candidate_variables = experiment.baseline_variables.clone();
        let id = experiment.id;
        c.store.create_experiment(experiment).await.unwrap();
        let err = c.start_experiment(&id).await.unwrap_err();
        assert!(matches!(err, PhoenixError::Validation(_)));
    }

    #[tokio::test]
    async fn deploying_transitions_to_running_once_all_deployments_live() {
        let c = controller();
        seed_templates(&c.store).await;
        let experiment = crate::model::test_support::sample_experiment();
        let id = experiment.id;
        c.store.create_experiment(experiment).await.unwrap();
        c.start_experiment(&id).await.unwrap();

        let deployments = c.store.list_deployments_for_experiment(&id).await.unwrap();
        for d in &deployments {
            c.on_deployment_status(&d.id, DeploymentStatus::Healthy, None).await.unwrap();
        }
        let exp = c.store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Running);
        assert!(exp.started_at.is_some());
    }

    #[tokio::test]
    async fn deployment_failure_during_deploying_poisons_the_experiment() {
        let c = controller();
        seed_templates(&c.store).await;
        let experiment = crate::model::test_support::sample_experiment();
        let id = experiment.id;
        c.store.create_experiment(experiment).await.unwrap();
        c.start_experiment(&id).await.unwrap();

        let deployments = c.store.list_deployments_for_experiment(&id).await.unwrap();
        c.on_deployment_status(&deployments[0].id, DeploymentStatus::Failed, None)
            .await
            .unwrap();
        let exp = c.store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Failed);
        assert_eq!(exp.failure_reason, Some(FailureReason::DeploymentFailed));
    }

    #[tokio::test]
    async fn stop_enqueues_stop_tasks_and_marks_stopped_once_hosts_ack() {
        let c = controller();
        seed_templates(&c.store).await;
        let experiment = crate::model::test_support::sample_experiment();
        let id = experiment.id;
        c.store.create_experiment(experiment).await.unwrap();
        c.start_experiment(&id).await.unwrap();
        let deployments = c.store.list_deployments_for_experiment(&id).await.unwrap();
        for d in &deployments {
            c.on_deployment_status(&d.id, DeploymentStatus::Healthy, None).await.unwrap();
        }
        c.stop_experiment(&id).await.unwrap();

        // Stop was requested but no host has acked yet: phase holds and
        // `stopped_at` is still unset.
        let exp = c.store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Running);
        assert!(exp.stopped_at.is_none());

        let tasks = c.store.list_tasks_for_experiment(&id).await.unwrap();
        assert!(tasks.iter().any(|t| t.action == TaskAction::Stop));

        for d in &deployments {
            c.on_deployment_status(&d.id, DeploymentStatus::Stopped, None).await.unwrap();
        }
        let exp = c.store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::Stopped);
        assert!(exp.stopped_at.is_some());
    }

    #[tokio::test]
    async fn rollback_stops_only_candidate_deployments() {
        let c = controller();
        seed_templates(&c.store).await;
        let experiment = crate::model::test_support::sample_experiment();
        let id = experiment.id;
        c.store.create_experiment(experiment).await.unwrap();
        c.start_experiment(&id).await.unwrap();
        let deployments = c.store.list_deployments_for_experiment(&id).await.unwrap();
        for d in &deployments {
            c.on_deployment_status(&d.id, DeploymentStatus::Healthy, None).await.unwrap();
        }
        c.rollback_experiment(&id).await.unwrap();
        let exp = c.store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(exp.phase, ExperimentPhase::RolledBack);

        let tasks = c.store.list_tasks_for_experiment(&id).await.unwrap();
        let stop_tasks: Vec<_> = tasks.iter().filter(|t| t.action == TaskAction::Stop).collect();
        assert_eq!(stop_tasks.len(), 1);
    }
}
