//! End-to-end scenarios exercising the Store, Task Queue, Experiment
//! Controller, and KPI Analyzer together, the way an operator's HTTP
//! calls and an agent's task reports actually drive them. Each test is
//! named after the scenario it stands in for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;

use phoenix_core::analyzer::{AnalysisRunner, Analyzer, RecordingMetricsBackend, Series};
use phoenix_core::config::ServerConfig;
use phoenix_core::controller::Controller;
use phoenix_core::hub::EventHub;
use phoenix_core::model::{
    DeploymentStatus, Experiment, ExperimentId, ExperimentPhase, FailureReason, HostId, TaskAction,
    TaskType, TemplateRef,
};
use phoenix_core::queue::TaskQueue;
use phoenix_core::store::memory::InMemoryStore;
use phoenix_core::store::Store;
use phoenix_core::templates;

fn fast_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.deploy_grace_window = StdDuration::from_millis(50);
    config.offline_after = StdDuration::from_millis(50);
    config.controller_tick_interval = StdDuration::from_millis(20);
    config
}

async fn seed_templates(store: &Arc<dyn Store>) {
    for t in templates::builtin::all_templates() {
        store.put_template(t).await.unwrap();
    }
}

fn experiment(hosts: &[&str], duration: chrono::Duration) -> Experiment {
    let now = Utc::now();
    Experiment {
        id: ExperimentId::new(),
        name: "topk-vs-baseline".to_string(),
        description: "compare cardinality under top-k filtering".to_string(),
        baseline_template: TemplateRef { name: "process-baseline-v1".to_string(), version: "1".to_string() },
        baseline_variables: HashMap::new(),
        candidate_template: TemplateRef { name: "process-topk-v1".to_string(), version: "1".to_string() },
        candidate_variables: HashMap::from([("k".to_string(), serde_json::json!(10))]),
        target_hosts: hosts.iter().map(|h| HostId::from(*h)).collect(),
        load_profile: None,
        duration,
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
    }
}

struct Harness {
    store: Arc<dyn Store>,
    controller: Controller,
    metrics: Arc<RecordingMetricsBackend>,
}

fn harness_with_config(config: ServerConfig) -> Harness {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue = Arc::new(TaskQueue::new(store.clone()));
    let hub = EventHub::new();
    let metrics = Arc::new(RecordingMetricsBackend::new());

    struct SharedBackend(Arc<RecordingMetricsBackend>);
    #[async_trait::async_trait]
    impl phoenix_core::analyzer::MetricsBackend for SharedBackend {
        async fn range_query(
            &self,
            expr: &str,
            start: chrono::DateTime<Utc>,
            end: chrono::DateTime<Utc>,
            step_secs: u64,
        ) -> Result<Vec<Series>, phoenix_core::analyzer::AnalyzerError> {
            self.0.range_query(expr, start, end, step_secs).await
        }
        async fn instant_query(
            &self,
            expr: &str,
            at: chrono::DateTime<Utc>,
        ) -> Result<Vec<Series>, phoenix_core::analyzer::AnalyzerError> {
            self.0.instant_query(expr, at).await
        }
    }

    let analyzer: Arc<dyn AnalysisRunner> = Arc::new(Analyzer::new(
        SharedBackend(metrics.clone()),
        config.cost_model,
        config.critical_process_names.clone(),
    ));
    let controller = Controller::new(store.clone(), queue, hub, analyzer, config);
    Harness { store, controller, metrics }
}

fn series(host: &str, value: f64) -> Series {
    let mut labels = HashMap::new();
    labels.insert("__name__".to_string(), "points_out".to_string());
    labels.insert("host".to_string(), host.to_string());
    Series { labels, points: vec![(Utc::now(), value)] }
}

/// S1. Happy A/B over two hosts: fan-out, deploy acks, duration
/// elapses, analyzer runs, experiment completes.
#[tokio::test]
async fn s1_happy_ab_over_two_hosts() {
    let h = harness_with_config(fast_config());
    seed_templates(&h.store).await;

    let exp = experiment(&["h1", "h2"], chrono::Duration::milliseconds(50));
    let id = exp.id;
    h.store.create_experiment(exp).await.unwrap();
    h.controller.start_experiment(&id).await.unwrap();

    let tasks = h.store.list_tasks_for_experiment(&id).await.unwrap();
    assert_eq!(tasks.len(), 4, "fan-out atomicity: |targets| x 2 collector/start tasks");
    assert!(tasks.iter().all(|t| t.task_type == TaskType::Collector && t.action == TaskAction::Start));

    let deployments = h.store.list_deployments_for_experiment(&id).await.unwrap();
    assert_eq!(deployments.len(), 4);
    for d in &deployments {
        h.controller.on_deployment_status(&d.id, DeploymentStatus::Healthy, None).await.unwrap();
    }
    let exp = h.store.get_experiment(&id).await.unwrap().unwrap();
    assert_eq!(exp.phase, ExperimentPhase::Running);

    h.metrics.set_series(
        &format!("{{experiment_id=\"{id}\",variant=\"baseline\"}}"),
        vec![series("h1", 10_000.0), series("h2", 9_000.0)],
    );
    h.metrics.set_series(
        &format!("{{experiment_id=\"{id}\",variant=\"candidate\"}}"),
        vec![series("h1", 3_000.0), series("h2", 2_500.0)],
    );

    tokio::time::sleep(StdDuration::from_millis(80)).await;
    h.controller.tick().await.unwrap();

    let exp = h.store.get_experiment(&id).await.unwrap().unwrap();
    assert_eq!(exp.phase, ExperimentPhase::Completed);
    let results = exp.results.expect("analyzer should have populated results");
    let reduction = results.cardinality_reduction_pct.expect("non-zero baseline should yield a reduction pct");
    assert!((0.0..=100.0).contains(&reduction));

    let tasks = h.store.list_tasks_for_experiment(&id).await.unwrap();
    let stop_tasks: Vec<_> = tasks.iter().filter(|t| t.action == TaskAction::Stop).collect();
    assert_eq!(stop_tasks.len(), 4, "stop enqueued for every live deployment on analysis entry");
}

/// S3. Rollback stops only the candidate variant across both hosts;
/// baseline deployments are left running.
#[tokio::test]
async fn s3_rollback_stops_only_candidate_across_hosts() {
    let h = harness_with_config(fast_config());
    seed_templates(&h.store).await;

    let exp = experiment(&["h1", "h2"], chrono::Duration::seconds(60));
    let id = exp.id;
    h.store.create_experiment(exp).await.unwrap();
    h.controller.start_experiment(&id).await.unwrap();

    let deployments = h.store.list_deployments_for_experiment(&id).await.unwrap();
    for d in &deployments {
        h.controller.on_deployment_status(&d.id, DeploymentStatus::Healthy, None).await.unwrap();
    }

    h.controller.rollback_experiment(&id).await.unwrap();

    let exp = h.store.get_experiment(&id).await.unwrap().unwrap();
    assert_eq!(exp.phase, ExperimentPhase::RolledBack);
    assert_eq!(exp.failure_reason, Some(FailureReason::OperatorRollback));

    let tasks = h.store.list_tasks_for_experiment(&id).await.unwrap();
    let stop_tasks: Vec<_> = tasks.iter().filter(|t| t.action == TaskAction::Stop).collect();
    assert_eq!(stop_tasks.len(), 2, "one stop per host, candidate variant only");

    let deployments = h.store.list_deployments_for_experiment(&id).await.unwrap();
    let baseline_still_healthy = deployments
        .iter()
        .filter(|d| d.variant == phoenix_core::model::Variant::Baseline)
        .all(|d| d.status == DeploymentStatus::Healthy);
    assert!(baseline_still_healthy, "baseline deployments must be untouched by rollback");
}

/// S4. One host never acks its deployment; once the deploy grace
/// window elapses the experiment fails with `hosts_unreachable`, and
/// the host that did come up has its deployments stopped.
#[tokio::test]
async fn s4_unresponsive_host_fails_after_grace_window() {
    let h = harness_with_config(fast_config());
    seed_templates(&h.store).await;

    let exp = experiment(&["h1", "h2"], chrono::Duration::seconds(60));
    let id = exp.id;
    h.store.create_experiment(exp).await.unwrap();
    h.controller.start_experiment(&id).await.unwrap();

    let deployments = h.store.list_deployments_for_experiment(&id).await.unwrap();
    // h1 comes up; h2 never reports back.
    for d in deployments.iter().filter(|d| d.host_id == HostId::from("h1")) {
        h.controller.on_deployment_status(&d.id, DeploymentStatus::Healthy, None).await.unwrap();
    }

    tokio::time::sleep(StdDuration::from_millis(80)).await;
    h.controller.tick().await.unwrap();

    let exp = h.store.get_experiment(&id).await.unwrap().unwrap();
    assert_eq!(exp.phase, ExperimentPhase::Failed);
    assert_eq!(exp.failure_reason, Some(FailureReason::HostsUnreachable));

    let tasks = h.store.list_tasks_for_experiment(&id).await.unwrap();
    let stop_tasks: Vec<_> = tasks
        .iter()
        .filter(|t| t.action == TaskAction::Stop && t.host_id == HostId::from("h1"))
        .collect();
    assert_eq!(stop_tasks.len(), 2, "h1's already-live deployments must be stopped");
}

/// S6. Two pollers racing the same host id against one queued task:
/// exactly one claims it.
#[tokio::test]
async fn s6_concurrent_claim_safety() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue = Arc::new(TaskQueue::new(store.clone()));

    let task = phoenix_core::model::Task::new(
        HostId::from("h1"),
        None,
        TaskType::Collector,
        TaskAction::Start,
        serde_json::json!({}),
        0,
    );
    queue.enqueue(task).await.unwrap();

    let q1 = queue.clone();
    let q2 = queue.clone();
    let poll = |q: Arc<TaskQueue>| async move {
        q.poll(&HostId::from("h1"), &["collector".to_string()], 10, StdDuration::from_millis(200))
            .await
            .unwrap()
    };
    let (r1, r2) = tokio::join!(poll(q1), poll(q2));

    let total_claimed = r1.len() + r2.len();
    assert_eq!(total_claimed, 1, "exactly one poller claims the single queued task");
}
