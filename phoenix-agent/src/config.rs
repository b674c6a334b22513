//! Agent configuration. Mirrors the control plane's `from_env()`
//! convention but is driven by `clap` since the agent is a CLI binary
//! with flags an operator reasonably types by hand at the prompt
//! (the server is deployment-config-only).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "phoenix-agent")]
#[command(about = "Phoenix host agent: polls the control plane, supervises collector processes")]
pub struct AgentConfig {
    /// Base URL of the control plane, e.g. http://localhost:8080
    #[arg(long, env = "PHOENIX_CONTROL_PLANE_URL", default_value = "http://localhost:8080")]
    pub control_plane_url: String,

    /// This host's identity, sent as `X-Agent-Host-ID` on every request.
    #[arg(long, env = "PHOENIX_HOST_ID")]
    pub host_id: String,

    /// Path to the collector binary this agent supervises.
    #[arg(long, env = "PHOENIX_COLLECTOR_BIN", default_value = "/usr/bin/otelcol")]
    pub collector_bin: PathBuf,

    /// Directory for rendered collector configs, pid files, and stderr tails.
    #[arg(long, env = "PHOENIX_AGENT_STATE_DIR", default_value = "/var/lib/phoenix-agent")]
    pub state_dir: PathBuf,

    /// Directory containing named load profile scripts for `loadsim/execute`.
    #[arg(long, env = "PHOENIX_LOADSIM_DIR", default_value = "/var/lib/phoenix-agent/loadsim")]
    pub loadsim_dir: PathBuf,

    /// Long-poll budget requested on each `/tasks` call, in seconds.
    #[arg(long, env = "PHOENIX_AGENT_POLL_WAIT_SECS", default_value = "30")]
    pub poll_wait_secs: u64,

    /// Interval between heartbeats when there's no other agent activity.
    #[arg(long, env = "PHOENIX_AGENT_HEARTBEAT_SECS", default_value = "15")]
    pub heartbeat_interval_secs: u64,

    /// How long to wait for a collector to reach "ready" before reporting failed.
    #[arg(long, env = "PHOENIX_AGENT_READY_TIMEOUT_SECS", default_value = "30")]
    pub ready_timeout_secs: u64,

    /// How long to wait for a graceful stop before sending SIGKILL.
    #[arg(long, env = "PHOENIX_AGENT_STOP_TIMEOUT_SECS", default_value = "10")]
    pub stop_timeout_secs: u64,

    /// `key=value,key=value` capabilities advertised on heartbeat.
    #[arg(long, env = "PHOENIX_AGENT_CAPABILITIES", default_value = "collector=true,loadsim=true,command=true")]
    pub capabilities: String,

    /// Log format: "pretty" or "json" (teacher convention for deployable binaries).
    #[arg(long, env = "PHOENIX_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl AgentConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn capabilities_map(&self) -> std::collections::HashMap<String, serde_json::Value> {
        self.capabilities
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), serde_json::Value::String(v.trim().to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_map_parses_pairs() {
        let config = AgentConfig {
            control_plane_url: "http://x".into(),
            host_id: "h1".into(),
            collector_bin: "/bin/otelcol".into(),
            state_dir: "/tmp".into(),
            loadsim_dir: "/tmp".into(),
            poll_wait_secs: 30,
            heartbeat_interval_secs: 15,
            ready_timeout_secs: 30,
            stop_timeout_secs: 10,
            capabilities: "collector=true,loadsim=false".into(),
            log_format: "pretty".into(),
        };
        let caps = config.capabilities_map();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps["collector"], serde_json::json!("true"));
    }
}
