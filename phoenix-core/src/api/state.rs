//! Shared state for all API handlers.

use crate::analyzer::{AnalysisRunner, Analyzer, RecordingMetricsBackend};
use crate::config::ServerConfig;
use crate::controller::Controller;
use crate::hub::EventHub;
use crate::queue::TaskQueue;
use crate::store::memory::InMemoryStore;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything a handler needs to serve a request: the store, the task
/// queue sitting on top of it, the event hub, the controller that
/// drives the phase state machine, and the resolved configuration.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<TaskQueue>,
    pub hub: Arc<EventHub>,
    pub controller: Arc<Controller>,
    pub config: Arc<ServerConfig>,
    pub rate_limiter: Arc<RateLimiterState>,
}

impl AppState {
    /// Build application state on the in-memory store and the
    /// recording metrics backend — the default runtime for tests and
    /// for a single-process deployment without a database.
    pub fn new(config: ServerConfig) -> Self {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let analyzer: Arc<dyn AnalysisRunner> = Arc::new(Analyzer::new(
            RecordingMetricsBackend::default(),
            config.cost_model,
            config.critical_process_names.clone(),
        ));
        Self::with_store_and_analyzer(store, analyzer, config)
    }

    pub fn with_store_and_analyzer(
        store: Arc<dyn Store>,
        analyzer: Arc<dyn AnalysisRunner>,
        config: ServerConfig,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(store.clone()));
        let hub = EventHub::new();
        let config = Arc::new(config);
        let controller = Arc::new(Controller::new(
            store.clone(),
            queue.clone(),
            hub.clone(),
            analyzer,
            (*config).clone(),
        ));
        let rate_limiter = Arc::new(RateLimiterState::new(RateLimiterConfig {
            requests_per_window: DEFAULT_RATE_LIMIT_RPM,
            window_duration: std::time::Duration::from_secs(60),
        }));
        Self {
            store,
            queue,
            hub,
            controller,
            config,
            rate_limiter,
        }
    }
}

const DEFAULT_RATE_LIMIT_RPM: u32 = 600;

/// Per-agent-host request rate limiter, same shape as the teacher's
/// `RateLimiterState`: a sliding fixed window per key, held in memory.
pub struct RateLimiterState {
    requests: RwLock<HashMap<String, RequestCount>>,
    config: RateLimiterConfig,
}

#[derive(Clone)]
struct RequestCount {
    count: u32,
    window_start: std::time::Instant,
}

#[derive(Clone)]
pub struct RateLimiterConfig {
    pub requests_per_window: u32,
    pub window_duration: std::time::Duration,
}

pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u32 },
}

impl RateLimiterState {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub async fn check_and_increment(&self, key: &str) -> RateLimitResult {
        let mut requests = self.requests.write().await;
        let now = std::time::Instant::now();

        let entry = requests.entry(key.to_string()).or_insert(RequestCount {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) > self.config.window_duration {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        if entry.count > self.config.requests_per_window {
            let reset_at = entry.window_start + self.config.window_duration;
            let remaining_secs = reset_at.saturating_duration_since(now).as_secs();
            RateLimitResult::Limited {
                retry_after_secs: remaining_secs as u32,
            }
        } else {
            RateLimitResult::Allowed {
                remaining: self.config.requests_per_window - entry.count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_then_limits_then_resets_per_key() {
        let limiter = RateLimiterState::new(RateLimiterConfig {
            requests_per_window: 2,
            window_duration: std::time::Duration::from_secs(60),
        });
        for _ in 0..2 {
            assert!(matches!(
                limiter.check_and_increment("host-a").await,
                RateLimitResult::Allowed { .. }
            ));
        }
        assert!(matches!(
            limiter.check_and_increment("host-a").await,
            RateLimitResult::Limited { .. }
        ));
        assert!(matches!(
            limiter.check_and_increment("host-b").await,
            RateLimitResult::Allowed { .. }
        ));
    }

    #[test]
    fn app_state_builds_with_default_config() {
        let state = AppState::new(ServerConfig::default());
        assert_eq!(state.config.bind_addr, ServerConfig::default().bind_addr);
    }
}
