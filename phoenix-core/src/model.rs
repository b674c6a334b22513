//! Core entity types shared by the Store, Queue, Controller, and API layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Opaque identifiers are plain strings at the wire level, but we
/// keep them as UUID-backed newtypes internally so the compiler catches
/// cross-entity id mixups; `Display`/`FromStr` round-trip through the plain
/// string form so the API boundary still sees opaque strings.
macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(ExperimentId);
opaque_id!(DeploymentId);
opaque_id!(TaskId);
opaque_id!(EventId);

/// Host ids are operator-assigned (hostnames, inventory ids); they are not
/// generated by us, so this is a thin string wrapper, not a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct HostId(pub String);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Experiment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    Created,
    Deploying,
    Running,
    Analyzing,
    Completed,
    Stopped,
    Failed,
    RolledBack,
}

impl ExperimentPhase {
    /// Terminal phases never transition further (testable property 3).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentPhase::Completed
                | ExperimentPhase::Failed
                | ExperimentPhase::Stopped
                | ExperimentPhase::RolledBack
        )
    }

    /// The allowed phase graph: `from -> to` edges, including the
    /// side transitions available from deploying/running/analyzing.
    pub fn can_transition_to(self, to: ExperimentPhase) -> bool {
        use ExperimentPhase::*;
        match (self, to) {
            (Created, Deploying) => true,
            (Deploying, Running) => true,
            (Running, Analyzing) => true,
            (Analyzing, Completed) => true,
            (Deploying | Running | Analyzing, Stopped) => true,
            (Deploying | Running | Analyzing, RolledBack) => true,
            (Deploying | Running | Analyzing, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExperimentPhase::Created => "created",
            ExperimentPhase::Deploying => "deploying",
            ExperimentPhase::Running => "running",
            ExperimentPhase::Analyzing => "analyzing",
            ExperimentPhase::Completed => "completed",
            ExperimentPhase::Stopped => "stopped",
            ExperimentPhase::Failed => "failed",
            ExperimentPhase::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Baseline => write!(f, "baseline"),
            Variant::Candidate => write!(f, "candidate"),
        }
    }
}

/// A reference to a registered (name, version) pipeline template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    pub version: String,
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// The reason recorded on `failed`/`rolled_back` experiments: every
/// experiment that transitions to one of those phases retains a
/// structured reason for why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HostsUnreachable,
    AnalysisTimeout,
    FanoutAborted,
    DeploymentFailed,
    OperatorStop,
    OperatorRollback,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::HostsUnreachable => "hosts_unreachable",
            FailureReason::AnalysisTimeout => "analysis_timeout",
            FailureReason::FanoutAborted => "fanout_aborted",
            FailureReason::DeploymentFailed => "deployment_failed",
            FailureReason::OperatorStop => "operator_stop",
            FailureReason::OperatorRollback => "operator_rollback",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub description: String,
    pub baseline_template: TemplateRef,
    pub baseline_variables: HashMap<String, serde_json::Value>,
    pub candidate_template: TemplateRef,
    pub candidate_variables: HashMap<String, serde_json::Value>,
    pub target_hosts: Vec<HostId>,
    pub load_profile: Option<String>,
    /// Duration the experiment stays in `running` before analysis begins.
    pub duration: chrono::Duration,
    pub phase: ExperimentPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub triggering_task: Option<TaskId>,
    pub results: Option<crate::analyzer::KpiResult>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Baseline and candidate must differ in template ref or in
    /// variables.
    pub fn variants_distinct(&self) -> bool {
        self.baseline_template != self.candidate_template
            || self.baseline_variables != self.candidate_variables
    }
}

// ============================================================================
// PipelineDeployment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Starting,
    Running,
    Degraded,
    Healthy,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Stopped | DeploymentStatus::Failed)
    }

    /// Counts as "healthy enough to proceed" for the deploying->running gate.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Running | DeploymentStatus::Healthy | DeploymentStatus::Degraded
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentMetrics {
    pub points_per_sec: Option<f64>,
    pub cardinality_reduction_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDeployment {
    pub id: DeploymentId,
    pub experiment_id: ExperimentId,
    pub variant: Variant,
    pub host_id: HostId,
    pub template: TemplateRef,
    pub rendered_config_hash: String,
    pub status: DeploymentStatus,
    pub metrics: DeploymentMetrics,
    pub last_status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Collector,
    Loadsim,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Start,
    Stop,
    Update,
    Rollback,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Testable property 2: the only allowed forward edges, plus the
    /// enqueue-time `pending -> failed` validation-failure edge.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Assigned, Failed)
                | (Pending, Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub host_id: HostId,
    pub experiment_id: Option<ExperimentId>,
    pub task_type: TaskType,
    pub action: TaskAction,
    pub config: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl Task {
    pub fn new(
        host_id: HostId,
        experiment_id: Option<ExperimentId>,
        task_type: TaskType,
        action: TaskAction,
        config: serde_json::Value,
        priority: i32,
    ) -> Self {
        Self {
            id: TaskId::new(),
            host_id,
            experiment_id,
            task_type,
            action,
            config,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }
}

/// Per-task-type stuck timeout used by the sweeper.
pub fn stuck_timeout(task_type: TaskType, loadsim_duration: Option<chrono::Duration>) -> chrono::Duration {
    match task_type {
        TaskType::Collector => chrono::Duration::minutes(2),
        TaskType::Command => chrono::Duration::minutes(1),
        TaskType::Loadsim => {
            loadsim_duration.unwrap_or_else(|| chrono::Duration::minutes(5))
                + chrono::Duration::minutes(1)
        }
    }
}

pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub active_task_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub host_id: HostId,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub first_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub health: AgentHealth,
    pub capabilities: HashMap<String, serde_json::Value>,
    pub active_task_ids: Vec<TaskId>,
    pub resource_usage: ResourceUsage,
}

/// `offline` iff `now - last_heartbeat > t_offline`.
pub fn effective_health(stored: AgentHealth, last_heartbeat: DateTime<Utc>, now: DateTime<Utc>, t_offline: chrono::Duration) -> AgentHealth {
    if now - last_heartbeat > t_offline {
        AgentHealth::Offline
    } else {
        stored
    }
}

// ============================================================================
// PipelineTemplate
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSchema {
    pub name: String,
    pub var_type: VariableType,
    pub default: Option<serde_json::Value>,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Integer,
    Float,
    Bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    pub version: String,
    pub description: String,
    pub body: String,
    pub variables: Vec<VariableSchema>,
}

// ============================================================================
// ExperimentEvent
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExperimentCreated,
    ExperimentStarted,
    ExperimentPhaseChanged,
    ExperimentCompleted,
    ExperimentFailed,
    DeploymentStatusChanged,
    AgentStatusChanged,
    MetricsUpdated,
    KpiComputed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::ExperimentCreated => "experiment_created",
            EventKind::ExperimentStarted => "experiment_started",
            EventKind::ExperimentPhaseChanged => "experiment_phase_changed",
            EventKind::ExperimentCompleted => "experiment_completed",
            EventKind::ExperimentFailed => "experiment_failed",
            EventKind::DeploymentStatusChanged => "deployment_status_changed",
            EventKind::AgentStatusChanged => "agent_status_changed",
            EventKind::MetricsUpdated => "metrics_updated",
            EventKind::KpiComputed => "kpi_computed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub id: EventId,
    pub experiment_id: ExperimentId,
    pub kind: EventKind,
    pub phase: Option<ExperimentPhase>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Shared fixtures for tests in other modules of this crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn sample_experiment() -> Experiment {
        Experiment {
            id: ExperimentId::new(),
            name: "e1".into(),
            description: "".into(),
            baseline_template: TemplateRef { name: "process-baseline-v1".into(), version: "1".into() },
            baseline_variables: HashMap::new(),
            candidate_template: TemplateRef { name: "process-topk-v1".into(), version: "1".into() },
            candidate_variables: HashMap::new(),
            target_hosts: vec![HostId::from("h1")],
            load_profile: None,
            duration: chrono::Duration::minutes(1),
            phase: ExperimentPhase::Created,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            completed_at: None,
            failure_reason: None,
            triggering_task: None,
            results: None,
            deleted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::sample_experiment;

    #[test]
    fn phase_graph_allows_documented_transitions() {
        use ExperimentPhase::*;
        assert!(Created.can_transition_to(Deploying));
        assert!(!Created.can_transition_to(Running));
        assert!(Deploying.can_transition_to(Running));
        assert!(Running.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Completed));
        for from in [Deploying, Running, Analyzing] {
            assert!(from.can_transition_to(Stopped));
            assert!(from.can_transition_to(RolledBack));
            assert!(from.can_transition_to(Failed));
        }
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Stopped.is_terminal());
        assert!(RolledBack.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn task_status_graph_allows_documented_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn experiment_variants_distinct_invariant() {
        let mut e = sample_experiment();
        assert!(e.variants_distinct());
        e.candidate_template = e.baseline_template.clone();
        e.candidate_variables = e.baseline_variables.clone();
        assert!(!e.variants_distinct());
    }
}
