//! Server configuration, loaded from environment variables.
//!
//! Follows the teacher's `from_env()` convention (`S3StorageConfig::from_env`,
//! `SemanticSearchConfig::from_env`): every field has a documented default,
//! env vars only override it, no config-file parser is introduced.

use std::net::SocketAddr;
use std::time::Duration;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    env_string(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Cost model coefficients: a linear function of ingest rate, applied
/// identically to baseline and candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub coefficient_per_point_per_sec: f64,
    pub fixed_overhead: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            coefficient_per_point_per_sec: 0.000_002,
            fixed_overhead: 0.0,
        }
    }
}

impl CostModel {
    pub fn from_env() -> Self {
        Self {
            coefficient_per_point_per_sec: env_string("PHOENIX_COST_COEFFICIENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::default().coefficient_per_point_per_sec),
            fixed_overhead: env_string("PHOENIX_COST_FIXED_OVERHEAD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::default().fixed_overhead),
        }
    }

    /// cost = fixed_overhead + coefficient * ingest_points_per_sec
    pub fn cost(&self, ingest_points_per_sec: f64) -> f64 {
        self.fixed_overhead + self.coefficient_per_point_per_sec * ingest_points_per_sec
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub long_poll_default_wait: Duration,
    pub long_poll_max_wait: Duration,
    pub sweep_interval: Duration,
    pub controller_tick_interval: Duration,
    pub max_retry_count: u32,
    pub offline_after: Duration,
    pub deploy_grace_window: Duration,
    pub analysis_slack: Duration,
    pub cost_model: CostModel,
    pub critical_process_names: Vec<String>,
    pub max_body_size: usize,
    pub cors_origins: Vec<String>,
    /// Address rendered into `METRICS_SINK_ADDR` for every deployed
    /// collector.
    pub metrics_sink_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            long_poll_default_wait: Duration::from_secs(30),
            long_poll_max_wait: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            controller_tick_interval: Duration::from_secs(2),
            max_retry_count: crate::model::DEFAULT_MAX_RETRY_COUNT,
            offline_after: Duration::from_secs(60),
            deploy_grace_window: Duration::from_secs(120),
            analysis_slack: Duration::from_secs(120),
            cost_model: CostModel::default(),
            critical_process_names: vec!["nginx".into(), "postgres".into(), "java".into()],
            max_body_size: 10 * 1024 * 1024,
            cors_origins: Vec::new(),
            metrics_sink_addr: "phoenix-metrics-sink:4317".into(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            bind_addr: env_string("PHOENIX_BIND_ADDR")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.bind_addr),
            database_url: env_string("PHOENIX_DATABASE_URL"),
            long_poll_default_wait: env_duration_secs(
                "PHOENIX_LONG_POLL_DEFAULT_WAIT_SECS",
                default.long_poll_default_wait,
            ),
            long_poll_max_wait: env_duration_secs(
                "PHOENIX_LONG_POLL_MAX_WAIT_SECS",
                default.long_poll_max_wait,
            ),
            sweep_interval: env_duration_secs("PHOENIX_SWEEP_INTERVAL_SECS", default.sweep_interval),
            controller_tick_interval: env_duration_secs(
                "PHOENIX_CONTROLLER_TICK_SECS",
                default.controller_tick_interval,
            ),
            max_retry_count: env_string("PHOENIX_MAX_RETRY_COUNT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_retry_count),
            offline_after: env_duration_secs("PHOENIX_OFFLINE_AFTER_SECS", default.offline_after),
            deploy_grace_window: env_duration_secs(
                "PHOENIX_DEPLOY_GRACE_SECS",
                default.deploy_grace_window,
            ),
            analysis_slack: env_duration_secs("PHOENIX_ANALYSIS_SLACK_SECS", default.analysis_slack),
            cost_model: CostModel::from_env(),
            critical_process_names: env_string("PHOENIX_CRITICAL_PROCESSES")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.critical_process_names),
            max_body_size: env_string("PHOENIX_MAX_BODY_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_body_size),
            cors_origins: env_string("PHOENIX_CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            metrics_sink_addr: env_string("PHOENIX_METRICS_SINK_ADDR")
                .unwrap_or(default.metrics_sink_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_model_applies_identically() {
        let model = CostModel::default();
        let baseline = model.cost(10_000.0);
        let candidate = model.cost(3_000.0);
        assert!(baseline > candidate);
        assert_eq!(model.cost(0.0), model.fixed_overhead);
    }
}
