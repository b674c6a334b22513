//! Control plane HTTP client: long-polls for tasks, reports status,
//! heartbeats, and pushes fleet gauges. Same shape as the registry
//! client's `Client` + config struct + thin `get`/`post` helpers, with
//! `X-Agent-Host-ID` standing in for the registry's bearer token.

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use phoenix_core::api::types::{
    AgentMetricsRequest, HeartbeatRequest, HeartbeatResponse, ReportTaskStatusRequest, TaskResponse,
};
use phoenix_core::model::TaskStatus;

use crate::error::{AgentError, Result};

#[derive(Clone)]
pub struct ControlPlaneClient {
    client: Client,
    base_url: String,
    host_id: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, host_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("phoenix-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::Network(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into(), host_id: host_id.into() })
    }

    /// Long-polls for up to `max_wait` (plus network latency); the
    /// server itself bounds this to its configured max, so a generous
    /// client-side budget never wedges the connection.
    pub async fn poll_tasks(&self, max_wait: Duration, max_tasks: usize) -> Result<Vec<TaskResponse>> {
        let url = format!(
            "{}/agent/tasks?max_wait_secs={}&max_tasks={}",
            self.base_url,
            max_wait.as_secs(),
            max_tasks
        );
        self.get(&url, max_wait + Duration::from_secs(10)).await
    }

    pub async fn report_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<TaskResponse> {
        let url = format!("{}/agent/tasks/{}/status", self.base_url, task_id);
        self.post(&url, &ReportTaskStatusRequest { status, result, error }).await
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = format!("{}/agent/heartbeat", self.base_url);
        self.post(&url, req).await
    }

    pub async fn push_metrics(&self, gauges: std::collections::HashMap<String, f64>) -> Result<()> {
        let url = format!("{}/agent/metrics", self.base_url);
        let _: serde_json::Value = self.post(&url, &AgentMetricsRequest { gauges }).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, timeout: Duration) -> Result<T> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .header("X-Agent-Host-ID", &self.host_id)
            .send()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        self.decode(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, url: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(url)
            .header("X-Agent-Host-ID", &self.host_id)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        self.decode(response).await
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            Ok(response.json::<T>().await.map_err(|e| AgentError::Network(e.to_string()))?)
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(AgentError::Api { status: status.as_u16(), message })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_nothing_for_well_formed_urls() {
        assert!(ControlPlaneClient::new("http://localhost:8080", "h1").is_ok());
    }
}
