//! PostgreSQL-backed `Store`, feature-gated behind
//! `postgres`. Uses `tokio-postgres` with a `deadpool-postgres`
//! connection pool, same shape as the teacher's `PostgresMetadataStore`:
//! a linear `SCHEMA_SQL` applied at startup rather than a migration
//! framework, JSONB columns for the nested/variable-shaped fields, and
//! one `pool.get().await` per call.
//!
//! Complex fields (label maps, variable maps, rendered config hashes,
//! KPI results) are stored as JSONB and round-tripped through
//! `serde_json`; scalar enums (`phase`, `status`, `task_type`, ...) are
//! stored as their `snake_case` serde text representation so the
//! column value a human reads in `psql` matches the wire API.

use super::{not_found, ExperimentFilter, Store};
use crate::error::{PhoenixError, Result};
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_postgres::{NoTls, Row};

pub struct PostgresStore {
    pool: Pool,
}

fn storage_err(e: impl std::fmt::Display) -> PhoenixError {
    PhoenixError::UnavailableTransient(format!("postgres: {e}"))
}

fn enum_to_text<T: Serialize>(v: &T) -> Result<String> {
    match serde_json::to_value(v)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn text_to_enum<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_value(Value::String(s.to_string()))?)
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let parsed = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(storage_err)?;

        let mut pool_config = Config::new();
        pool_config.host = parsed.get_hosts().first().map(|h| match h {
            tokio_postgres::config::Host::Tcp(s) => s.clone(),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(p) => p.to_string_lossy().to_string(),
        });
        pool_config.port = parsed.get_ports().first().copied();
        pool_config.user = parsed.get_user().map(String::from);
        pool_config.password = parsed
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string());
        pool_config.dbname = parsed.get_dbname().map(String::from);
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(storage_err)?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        client.batch_execute(SCHEMA_SQL).await.map_err(storage_err)?;
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    baseline_template JSONB NOT NULL,
    baseline_variables JSONB NOT NULL,
    candidate_template JSONB NOT NULL,
    candidate_variables JSONB NOT NULL,
    target_hosts JSONB NOT NULL,
    load_profile TEXT,
    duration_secs BIGINT NOT NULL,
    phase TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    stopped_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    failure_reason TEXT,
    triggering_task UUID,
    results JSONB,
    deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS deployments (
    id UUID PRIMARY KEY,
    experiment_id UUID NOT NULL REFERENCES experiments(id),
    variant TEXT NOT NULL,
    host_id TEXT NOT NULL,
    template JSONB NOT NULL,
    rendered_config_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    metrics JSONB NOT NULL,
    last_status_message TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deployments_experiment ON deployments(experiment_id);

CREATE TABLE IF NOT EXISTS tasks (
    id UUID PRIMARY KEY,
    host_id TEXT NOT NULL,
    experiment_id UUID REFERENCES experiments(id),
    task_type TEXT NOT NULL,
    action TEXT NOT NULL,
    config JSONB NOT NULL,
    priority INT NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    assigned_at TIMESTAMPTZ,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    result JSONB,
    error TEXT,
    retry_count INT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_host_status ON tasks(host_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_experiment ON tasks(experiment_id);

CREATE TABLE IF NOT EXISTS agents (
    host_id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    address TEXT NOT NULL,
    version TEXT NOT NULL,
    first_seen TIMESTAMPTZ NOT NULL,
    last_heartbeat TIMESTAMPTZ NOT NULL,
    health TEXT NOT NULL,
    capabilities JSONB NOT NULL,
    active_task_ids JSONB NOT NULL,
    resource_usage JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS experiment_events (
    id UUID PRIMARY KEY,
    experiment_id UUID NOT NULL REFERENCES experiments(id),
    kind TEXT NOT NULL,
    phase TEXT,
    message TEXT NOT NULL,
    metadata JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_experiment ON experiment_events(experiment_id, created_at);

CREATE TABLE IF NOT EXISTS pipeline_templates (
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    description TEXT NOT NULL,
    body TEXT NOT NULL,
    variables JSONB NOT NULL,
    PRIMARY KEY (name, version)
);
"#;

fn row_to_experiment(row: &Row) -> Result<Experiment> {
    Ok(Experiment {
        id: ExperimentId(row.get("id")),
        name: row.get("name"),
        description: row.get("description"),
        baseline_template: serde_json::from_value(row.get("baseline_template"))?,
        baseline_variables: serde_json::from_value(row.get("baseline_variables"))?,
        candidate_template: serde_json::from_value(row.get("candidate_template"))?,
        candidate_variables: serde_json::from_value(row.get("candidate_variables"))?,
        target_hosts: serde_json::from_value(row.get("target_hosts"))?,
        load_profile: row.get("load_profile"),
        duration: chrono::Duration::seconds(row.get::<_, i64>("duration_secs")),
        phase: text_to_enum(row.get("phase"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        stopped_at: row.get("stopped_at"),
        completed_at: row.get("completed_at"),
        failure_reason: row
            .get::<_, Option<String>>("failure_reason")
            .map(|s| text_to_enum(&s))
            .transpose()?,
        triggering_task: row
            .get::<_, Option<uuid::Uuid>>("triggering_task")
            .map(TaskId),
        results: row
            .get::<_, Option<Value>>("results")
            .map(serde_json::from_value)
            .transpose()?,
        deleted_at: row.get("deleted_at"),
    })
}

fn row_to_deployment(row: &Row) -> Result<PipelineDeployment> {
    Ok(PipelineDeployment {
        id: DeploymentId(row.get("id")),
        experiment_id: ExperimentId(row.get("experiment_id")),
        variant: text_to_enum(row.get("variant"))?,
        host_id: HostId(row.get("host_id")),
        template: serde_json::from_value(row.get("template"))?,
        rendered_config_hash: row.get("rendered_config_hash"),
        status: text_to_enum(row.get("status"))?,
        metrics: serde_json::from_value(row.get("metrics"))?,
        last_status_message: row.get("last_status_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_task(row: &Row) -> Result<Task> {
    Ok(Task {
        id: TaskId(row.get("id")),
        host_id: HostId(row.get("host_id")),
        experiment_id: row.get::<_, Option<uuid::Uuid>>("experiment_id").map(ExperimentId),
        task_type: text_to_enum(row.get("task_type"))?,
        action: text_to_enum(row.get("action"))?,
        config: row.get("config"),
        priority: row.get("priority"),
        status: text_to_enum(row.get("status"))?,
        created_at: row.get("created_at"),
        assigned_at: row.get("assigned_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        result: row.get("result"),
        error: row.get("error"),
        retry_count: row.get::<_, i32>("retry_count") as u32,
    })
}

fn row_to_agent(row: &Row) -> Result<AgentRecord> {
    Ok(AgentRecord {
        host_id: HostId(row.get("host_id")),
        hostname: row.get("hostname"),
        address: row.get("address"),
        version: row.get("version"),
        first_seen: row.get("first_seen"),
        last_heartbeat: row.get("last_heartbeat"),
        health: text_to_enum(row.get("health"))?,
        capabilities: serde_json::from_value(row.get("capabilities"))?,
        active_task_ids: serde_json::from_value(row.get("active_task_ids"))?,
        resource_usage: serde_json::from_value(row.get("resource_usage"))?,
    })
}

fn row_to_event(row: &Row) -> Result<ExperimentEvent> {
    Ok(ExperimentEvent {
        id: EventId(row.get("id")),
        experiment_id: ExperimentId(row.get("experiment_id")),
        kind: text_to_enum(row.get("kind"))?,
        phase: row
            .get::<_, Option<String>>("phase")
            .map(|s| text_to_enum(&s))
            .transpose()?,
        message: row.get("message"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    })
}

fn row_to_template(row: &Row) -> Result<PipelineTemplate> {
    Ok(PipelineTemplate {
        name: row.get("name"),
        version: row.get("version"),
        description: row.get("description"),
        body: row.get("body"),
        variables: serde_json::from_value(row.get("variables"))?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_experiment(&self, e: Experiment) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .execute(
                "INSERT INTO experiments (id, name, description, baseline_template, baseline_variables, \
                 candidate_template, candidate_variables, target_hosts, load_profile, duration_secs, phase, \
                 created_at, updated_at, started_at, stopped_at, completed_at, failure_reason, triggering_task, \
                 results, deleted_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20) \
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &e.id.0,
                    &e.name,
                    &e.description,
                    &serde_json::to_value(&e.baseline_template)?,
                    &serde_json::to_value(&e.baseline_variables)?,
                    &serde_json::to_value(&e.candidate_template)?,
                    &serde_json::to_value(&e.candidate_variables)?,
                    &serde_json::to_value(&e.target_hosts)?,
                    &e.load_profile,
                    &e.duration.num_seconds(),
                    &enum_to_text(&e.phase)?,
                    &e.created_at,
                    &e.updated_at,
                    &e.started_at,
                    &e.stopped_at,
                    &e.completed_at,
                    &e.failure_reason.map(|r| enum_to_text(&r)).transpose()?,
                    &e.triggering_task.map(|t| t.0),
                    &e.results.map(|r| serde_json::to_value(r)).transpose()?,
                    &e.deleted_at,
                ],
            )
            .await
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(PhoenixError::Conflict(format!("experiment {} already exists", e.id)));
        }
        Ok(())
    }

    async fn get_experiment(&self, id: &ExperimentId) -> Result<Option<Experiment>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let row = client
            .query_opt("SELECT * FROM experiments WHERE id = $1", &[&id.0])
            .await
            .map_err(storage_err)?;
        row.map(|r| row_to_experiment(&r)).transpose()
    }

    async fn list_experiments(&self, filter: ExperimentFilter) -> Result<Vec<Experiment>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let mut sql = "SELECT * FROM experiments WHERE 1=1".to_string();
        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if let Some(phase) = filter.phase {
            sql.push_str(&format!(" AND phase = '{}'", enum_to_text(&phase)?));
        }
        sql.push_str(" ORDER BY created_at ASC");
        let rows = client.query(&sql, &[]).await.map_err(storage_err)?;
        rows.iter().map(row_to_experiment).collect()
    }

    async fn update_experiment(
        &self,
        id: &ExperimentId,
        f: Box<dyn FnOnce(&mut Experiment) + Send>,
    ) -> Result<()> {
        let mut client = self.pool.get().await.map_err(storage_err)?;
        let txn = client.transaction().await.map_err(storage_err)?;
        let row = txn
            .query_opt("SELECT * FROM experiments WHERE id = $1 FOR UPDATE", &[&id.0])
            .await
            .map_err(storage_err)?
            .ok_or_else(|| not_found("experiment", id))?;
        let mut experiment = row_to_experiment(&row)?;
        f(&mut experiment);
        experiment.updated_at = Utc::now();
        txn.execute(
            "UPDATE experiments SET name=$2, description=$3, started_at=$4, stopped_at=$5, \
             completed_at=$6, failure_reason=$7, results=$8, updated_at=$9 WHERE id=$1",
            &[
                &id.0,
                &experiment.name,
                &experiment.description,
                &experiment.started_at,
                &experiment.stopped_at,
                &experiment.completed_at,
                &experiment.failure_reason.map(|r| enum_to_text(&r)).transpose()?,
                &experiment.results.map(|r| serde_json::to_value(r)).transpose()?,
                &experiment.updated_at,
            ],
        )
        .await
        .map_err(storage_err)?;
        txn.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn transition_experiment_phase(
        &self,
        id: &ExperimentId,
        from: ExperimentPhase,
        to: ExperimentPhase,
    ) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let current: Option<String> = client
            .query_opt("SELECT phase FROM experiments WHERE id = $1", &[&id.0])
            .await
            .map_err(storage_err)?
            .map(|r| r.get("phase"));
        let current = current.ok_or_else(|| not_found("experiment", id))?;
        let current: ExperimentPhase = text_to_enum(&current)?;
        if current == to {
            return Ok(());
        }
        if current != from {
            return Err(PhoenixError::Conflict(format!(
                "experiment {id} is in phase {current:?}, expected {from:?}"
            )));
        }
        if !from.can_transition_to(to) {
            return Err(PhoenixError::Conflict(format!(
                "illegal phase transition {from:?} -> {to:?}"
            )));
        }
        let rows = client
            .execute(
                "UPDATE experiments SET phase = $3, updated_at = now() WHERE id = $1 AND phase = $2",
                &[&id.0, &enum_to_text(&from)?, &enum_to_text(&to)?],
            )
            .await
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(PhoenixError::Conflict(format!(
                "experiment {id} phase changed concurrently"
            )));
        }
        Ok(())
    }

    async fn soft_delete_experiment(&self, id: &ExperimentId) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .execute(
                "UPDATE experiments SET deleted_at = now() WHERE id = $1",
                &[&id.0],
            )
            .await
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(not_found("experiment", id));
        }
        Ok(())
    }

    async fn create_deployment(&self, d: PipelineDeployment) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        client
            .execute(
                "INSERT INTO deployments (id, experiment_id, variant, host_id, template, \
                 rendered_config_hash, status, metrics, last_status_message, created_at, updated_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
                &[
                    &d.id.0,
                    &d.experiment_id.0,
                    &enum_to_text(&d.variant)?,
                    &d.host_id.0,
                    &serde_json::to_value(&d.template)?,
                    &d.rendered_config_hash,
                    &enum_to_text(&d.status)?,
                    &serde_json::to_value(&d.metrics)?,
                    &d.last_status_message,
                    &d.created_at,
                    &d.updated_at,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<PipelineDeployment>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let row = client
            .query_opt("SELECT * FROM deployments WHERE id = $1", &[&id.0])
            .await
            .map_err(storage_err)?;
        row.map(|r| row_to_deployment(&r)).transpose()
    }

    async fn list_deployments_for_experiment(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<PipelineDeployment>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .query(
                "SELECT * FROM deployments WHERE experiment_id = $1 ORDER BY created_at ASC",
                &[&experiment_id.0],
            )
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_deployment).collect()
    }

    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .execute(
                "UPDATE deployments SET status = $2, \
                 last_status_message = COALESCE($3, last_status_message), updated_at = now() WHERE id = $1",
                &[&id.0, &enum_to_text(&status)?, &message],
            )
            .await
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(not_found("deployment", id));
        }
        Ok(())
    }

    async fn enqueue_task(&self, t: Task) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        client
            .execute(
                "INSERT INTO tasks (id, host_id, experiment_id, task_type, action, config, priority, \
                 status, created_at, assigned_at, started_at, completed_at, result, error, retry_count) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
                &[
                    &t.id.0,
                    &t.host_id.0,
                    &t.experiment_id.map(|e| e.0),
                    &enum_to_text(&t.task_type)?,
                    &enum_to_text(&t.action)?,
                    &t.config,
                    &t.priority,
                    &enum_to_text(&t.status)?,
                    &t.created_at,
                    &t.assigned_at,
                    &t.started_at,
                    &t.completed_at,
                    &t.result,
                    &t.error,
                    &(t.retry_count as i32),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let row = client
            .query_opt("SELECT * FROM tasks WHERE id = $1", &[&id.0])
            .await
            .map_err(storage_err)?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    async fn claim_next_tasks(
        &self,
        host_id: &HostId,
        capabilities: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let mut client = self.pool.get().await.map_err(storage_err)?;
        let txn = client.transaction().await.map_err(storage_err)?;
        let task_types: Vec<String> = capabilities.to_vec();
        let rows = txn
            .query(
                "SELECT id FROM tasks WHERE host_id = $1 AND status = 'pending' AND task_type = ANY($2) \
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT $3 FOR UPDATE SKIP LOCKED",
                &[&host_id.0, &task_types, &(max_tasks as i64)],
            )
            .await
            .map_err(storage_err)?;
        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: uuid::Uuid = row.get("id");
            let updated = txn
                .query_one(
                    "UPDATE tasks SET status = 'assigned', assigned_at = $2 WHERE id = $1 RETURNING *",
                    &[&id, &now],
                )
                .await
                .map_err(storage_err)?;
            claimed.push(row_to_task(&updated)?);
        }
        txn.commit().await.map_err(storage_err)?;
        Ok(claimed)
    }

    async fn report_task(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut client = self.pool.get().await.map_err(storage_err)?;
        let txn = client.transaction().await.map_err(storage_err)?;
        let row = txn
            .query_opt("SELECT * FROM tasks WHERE id = $1 FOR UPDATE", &[&id.0])
            .await
            .map_err(storage_err)?
            .ok_or_else(|| not_found("task", id))?;
        let current = row_to_task(&row)?;
        if current.status == status {
            txn.commit().await.map_err(storage_err)?;
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(PhoenixError::Conflict(format!(
                "task {id} cannot move from {:?} to {:?}",
                current.status, status
            )));
        }
        let started_at = if status == TaskStatus::Running && current.started_at.is_none() {
            Some(now)
        } else {
            current.started_at
        };
        let completed_at = if status.is_terminal() { Some(now) } else { None };
        let updated = txn
            .query_one(
                "UPDATE tasks SET status = $2, started_at = $3, completed_at = $4, result = $5, error = $6 \
                 WHERE id = $1 RETURNING *",
                &[&id.0, &enum_to_text(&status)?, &started_at, &completed_at, &result, &error],
            )
            .await
            .map_err(storage_err)?;
        txn.commit().await.map_err(storage_err)?;
        row_to_task(&updated)
    }

    async fn list_stale_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .query(
                "SELECT * FROM tasks WHERE status IN ('assigned','running')",
                &[],
            )
            .await
            .map_err(storage_err)?;
        let mut stale = Vec::new();
        for row in &rows {
            let task = row_to_task(row)?;
            let reference = task.assigned_at.or(task.started_at).unwrap_or(task.created_at);
            let loadsim_duration = task
                .config
                .get("duration_secs")
                .and_then(|v| v.as_i64())
                .map(chrono::Duration::seconds);
            if now - reference > crate::model::stuck_timeout(task.task_type, loadsim_duration) {
                stale.push(task);
            }
        }
        Ok(stale)
    }

    async fn requeue_task(&self, id: &TaskId, _now: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .execute(
                "UPDATE tasks SET status = 'pending', assigned_at = NULL, started_at = NULL, \
                 retry_count = retry_count + 1 WHERE id = $1",
                &[&id.0],
            )
            .await
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(not_found("task", id));
        }
        Ok(())
    }

    async fn fail_task(&self, id: &TaskId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .execute(
                "UPDATE tasks SET status = 'failed', error = $2, completed_at = $3 WHERE id = $1",
                &[&id.0, &reason, &now],
            )
            .await
            .map_err(storage_err)?;
        if rows == 0 {
            return Err(not_found("task", id));
        }
        Ok(())
    }

    async fn list_tasks_for_experiment(&self, experiment_id: &ExperimentId) -> Result<Vec<Task>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .query(
                "SELECT * FROM tasks WHERE experiment_id = $1 ORDER BY created_at ASC",
                &[&experiment_id.0],
            )
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn upsert_agent(&self, r: AgentRecord) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        client
            .execute(
                "INSERT INTO agents (host_id, hostname, address, version, first_seen, last_heartbeat, \
                 health, capabilities, active_task_ids, resource_usage) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
                 ON CONFLICT (host_id) DO UPDATE SET hostname=$2, address=$3, version=$4, \
                 last_heartbeat=$6, health=$7, capabilities=$8, active_task_ids=$9, resource_usage=$10",
                &[
                    &r.host_id.0,
                    &r.hostname,
                    &r.address,
                    &r.version,
                    &r.first_seen,
                    &r.last_heartbeat,
                    &enum_to_text(&r.health)?,
                    &serde_json::to_value(&r.capabilities)?,
                    &serde_json::to_value(&r.active_task_ids)?,
                    &serde_json::to_value(&r.resource_usage)?,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_agent(&self, host_id: &HostId) -> Result<Option<AgentRecord>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let row = client
            .query_opt("SELECT * FROM agents WHERE host_id = $1", &[&host_id.0])
            .await
            .map_err(storage_err)?;
        row.map(|r| row_to_agent(&r)).transpose()
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .query("SELECT * FROM agents ORDER BY host_id ASC", &[])
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn append_event(&self, e: ExperimentEvent) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        client
            .execute(
                "INSERT INTO experiment_events (id, experiment_id, kind, phase, message, metadata, created_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7)",
                &[
                    &e.id.0,
                    &e.experiment_id.0,
                    &enum_to_text(&e.kind)?,
                    &e.phase.map(|p| enum_to_text(&p)).transpose()?,
                    &e.message,
                    &e.metadata,
                    &e.created_at,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list_events(
        &self,
        experiment_id: &ExperimentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExperimentEvent>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = match since {
            Some(since) => {
                client
                    .query(
                        "SELECT * FROM experiment_events WHERE experiment_id = $1 AND created_at > $2 \
                         ORDER BY created_at ASC",
                        &[&experiment_id.0, &since],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        "SELECT * FROM experiment_events WHERE experiment_id = $1 ORDER BY created_at ASC",
                        &[&experiment_id.0],
                    )
                    .await
            }
        }
        .map_err(storage_err)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn get_template(&self, name: &str, version: &str) -> Result<Option<PipelineTemplate>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let row = client
            .query_opt(
                "SELECT * FROM pipeline_templates WHERE name = $1 AND version = $2",
                &[&name, &version],
            )
            .await
            .map_err(storage_err)?;
        row.map(|r| row_to_template(&r)).transpose()
    }

    async fn list_templates(&self) -> Result<Vec<PipelineTemplate>> {
        let client = self.pool.get().await.map_err(storage_err)?;
        let rows = client
            .query("SELECT * FROM pipeline_templates ORDER BY name ASC, version ASC", &[])
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_template).collect()
    }

    async fn put_template(&self, t: PipelineTemplate) -> Result<()> {
        let client = self.pool.get().await.map_err(storage_err)?;
        client
            .execute(
                "INSERT INTO pipeline_templates (name, version, description, body, variables) \
                 VALUES ($1,$2,$3,$4,$5) \
                 ON CONFLICT (name, version) DO UPDATE SET description=$3, body=$4, variables=$5",
                &[&t.name, &t.version, &t.description, &t.body, &serde_json::to_value(&t.variables)?],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
