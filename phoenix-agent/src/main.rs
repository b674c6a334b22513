//! Phoenix host agent entry point.
//!
//! On startup: reconcile any collector processes left running by a
//! prior instance of this agent, then run two concurrent loops for the
//! rest of the process lifetime — a long-poll task loop (capped at one
//! in-flight poll, per host, as the protocol requires) and a heartbeat
//! loop that reports resource usage on a fixed interval.

mod client;
mod config;
mod error;
mod loadsim;
mod resource;
mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use dashmap::DashSet;

use phoenix_core::api::types::{HeartbeatRequest, TaskResponse};
use phoenix_core::model::{TaskAction, TaskStatus, TaskType};

use client::ControlPlaneClient;
use config::AgentConfig;
use error::Result;
use supervisor::CollectorSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::parse();
    init_tracing(&config.log_format);

    tracing::info!(
        control_plane_url = %config.control_plane_url,
        host_id = %config.host_id,
        "starting phoenix agent"
    );

    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::create_dir_all(&config.loadsim_dir)?;

    let client = Arc::new(ControlPlaneClient::new(config.control_plane_url.clone(), config.host_id.clone())?);
    let supervisor = Arc::new(CollectorSupervisor::new(config.state_dir.clone(), config.collector_bin.clone()));

    supervisor.reconcile(&client).await?;

    let active_tasks: Arc<DashSet<String>> = Arc::new(DashSet::new());

    let heartbeat_handle = tokio::spawn(heartbeat_loop(config.clone(), client.clone(), active_tasks.clone()));
    let poll_result = poll_loop(config, client, supervisor, active_tasks).await;

    heartbeat_handle.abort();
    poll_result
}

/// Single-flight long-poll loop: at most one `poll_tasks` call is ever
/// in flight, satisfying the per-host concurrent-poll cap.
async fn poll_loop(
    config: AgentConfig,
    client: Arc<ControlPlaneClient>,
    supervisor: Arc<CollectorSupervisor>,
    active_tasks: Arc<DashSet<String>>,
) -> Result<()> {
    loop {
        let tasks = match client.poll_tasks(config.poll_wait(), 8).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "poll_tasks failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        for task in tasks {
            let config = config.clone();
            let client = client.clone();
            let supervisor = supervisor.clone();
            let active_tasks = active_tasks.clone();
            tokio::spawn(async move {
                active_tasks.insert(task.id.clone());
                run_task(&config, &client, &supervisor, &task).await;
                active_tasks.remove(&task.id);
            });
        }
    }
}

async fn run_task(
    config: &AgentConfig,
    client: &ControlPlaneClient,
    supervisor: &CollectorSupervisor,
    task: &TaskResponse,
) {
    let outcome = dispatch(config, supervisor, task).await;
    let (status, result, error) = match outcome {
        Ok(result) => (TaskStatus::Completed, result, None),
        Err(e) => (TaskStatus::Failed, None, Some(e.to_string())),
    };
    if let Err(e) = client.report_task_status(&task.id, status, result, error).await {
        tracing::warn!(task_id = %task.id, error = %e, "failed to report task status");
    }
}

async fn dispatch(
    config: &AgentConfig,
    supervisor: &CollectorSupervisor,
    task: &TaskResponse,
) -> Result<Option<serde_json::Value>> {
    match (task.task_type, task.action) {
        (TaskType::Collector, TaskAction::Start) => {
            let deployment_id = field_str(&task.config, "deployment_id")?;
            let variant = field_str(&task.config, "variant")?;
            let config_text = field_str(&task.config, "config")?;
            let config_hash = field_str(&task.config, "config_hash")?;
            supervisor
                .start(&variant, &task.id, &deployment_id, &config_text, &config_hash, &HashMap::new(), config.ready_timeout())
                .await?;
            Ok(None)
        }
        (TaskType::Collector, TaskAction::Stop) | (TaskType::Collector, TaskAction::Rollback) => {
            let variant = field_str(&task.config, "variant").unwrap_or_else(|_| "candidate".to_string());
            supervisor.stop(&variant, config.stop_timeout()).await?;
            Ok(None)
        }
        (TaskType::Collector, TaskAction::Update) => {
            let deployment_id = field_str(&task.config, "deployment_id")?;
            let variant = field_str(&task.config, "variant")?;
            let config_text = field_str(&task.config, "config")?;
            let config_hash = field_str(&task.config, "config_hash")?;
            supervisor.stop(&variant, config.stop_timeout()).await?;
            supervisor
                .start(&variant, &task.id, &deployment_id, &config_text, &config_hash, &HashMap::new(), config.ready_timeout())
                .await?;
            Ok(None)
        }
        (TaskType::Loadsim, TaskAction::Execute) => {
            let default_timeout = config.poll_wait() * 4;
            let result = loadsim::execute(&config.loadsim_dir, &task.config, default_timeout).await?;
            Ok(Some(result))
        }
        (task_type, action) => Err(error::AgentError::Process(format!(
            "no handler for task type {:?} action {:?}",
            task_type, action
        ))),
    }
}

fn field_str(config: &serde_json::Value, field: &str) -> Result<String> {
    config
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| error::AgentError::Process(format!("task config missing field `{field}`")))
}

async fn heartbeat_loop(config: AgentConfig, client: Arc<ControlPlaneClient>, active_tasks: Arc<DashSet<String>>) {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| config.host_id.clone());
    let mut interval = tokio::time::interval(config.heartbeat_interval());
    loop {
        interval.tick().await;
        let active_task_ids: Vec<String> = active_tasks.iter().map(|t| t.clone()).collect();
        let usage = resource::sample(std::time::Duration::from_millis(500), active_task_ids.len() as u32).await;
        let request = HeartbeatRequest {
            hostname: hostname.clone(),
            address: config.host_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: config.capabilities_map(),
            active_task_ids,
            resource_usage: usage,
        };
        if let Err(e) = client.heartbeat(&request).await {
            tracing::warn!(error = %e, "heartbeat failed");
        }
    }
}

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
