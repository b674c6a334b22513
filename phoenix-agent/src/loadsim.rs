//! `loadsim/execute` dispatch: runs a named load profile script under
//! `loadsim_dir` with a bounded duration, reporting the task result by
//! the child's exit status. Profiles are plain executable files; the
//! agent imposes no format on them beyond "runnable and exits 0 on
//! success", the same hands-off contract the supervisor gives the
//! collector binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{AgentError, Result};

#[derive(Debug, Deserialize)]
struct LoadsimConfig {
    load_profile: String,
    #[serde(default)]
    duration_secs: Option<u64>,
    #[serde(default)]
    args: Vec<String>,
}

/// Runs `<loadsim_dir>/<load_profile>` for up to `duration_secs` (or
/// `default_timeout` when the task omits one), killing it on timeout.
/// Returns the exit status as the task result payload on success.
pub async fn execute(
    loadsim_dir: &PathBuf,
    config: &serde_json::Value,
    default_timeout: Duration,
) -> Result<serde_json::Value> {
    let config: LoadsimConfig = serde_json::from_value(config.clone())?;
    let script = loadsim_dir.join(&config.load_profile);
    if !script.exists() {
        return Err(AgentError::Process(format!("load profile not found: {}", script.display())));
    }

    let timeout = config.duration_secs.map(Duration::from_secs).unwrap_or(default_timeout);

    let mut cmd = Command::new(&script);
    cmd.args(&config.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| AgentError::Process(format!("spawn failed: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(AgentError::Process(format!("load profile wait failed: {e}"))),
        Err(_) => {
            return Err(AgentError::Process(format!(
                "load profile {} exceeded its {}s budget",
                config.load_profile,
                timeout.as_secs()
            )))
        }
    };

    if !output.status.success() {
        return Err(AgentError::Process(format!(
            "load profile {} exited with {}: {}",
            config.load_profile,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(serde_json::json!({
        "load_profile": config.load_profile,
        "exit_code": output.status.code(),
        "stdout_tail": String::from_utf8_lossy(&output.stdout).chars().rev().take(2048).collect::<String>().chars().rev().collect::<String>(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_profile_is_reported_as_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::json!({ "load_profile": "does-not-exist.sh" });
        let err = execute(&dir.path().to_path_buf(), &config, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Process(_)));
    }

    #[tokio::test]
    async fn successful_profile_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("ok.sh");
        std::fs::write(&script_path, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = serde_json::json!({ "load_profile": "ok.sh" });
        let result = execute(&dir.path().to_path_buf(), &config, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], serde_json::json!(0));
    }
}
