//! API Server
//!
//! Wires routes, middleware, and shared state into a runnable server.

use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

use crate::api::{middleware as mw, routes, state::AppState};
use crate::config::ServerConfig;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub server: ServerConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self { bind_addr: server.bind_addr, server }
    }
}

impl ApiConfig {
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
    router: Router,
}

impl ApiServer {
    pub fn new(config: ApiConfig) -> Self {
        let state = AppState::new(config.server.clone());
        let router = Self::build_router(&state);
        Self { config, state, router }
    }

    pub fn with_state(state: AppState, config: ApiConfig) -> Self {
        let router = Self::build_router(&state);
        Self { config, state, router }
    }

    pub fn with_defaults() -> Self {
        Self::new(ApiConfig::default())
    }

    fn build_router(state: &AppState) -> Router {
        let api = routes::api_router(state.clone());

        api
            // Error handling (outermost, catches everything downstream).
            .layer(middleware::from_fn(mw::error_handler_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), mw::cors_middleware))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                mw::rate_limit_middleware,
            ))
            .layer(middleware::from_fn(mw::request_id_middleware))
            // Applied last so it runs first, rejecting oversized bodies
            // before any handler or auth work happens.
            .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "phoenix control plane listening");
        axum::serve(listener, self.router).await?;
        Ok(())
    }

    pub async fn run_until<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "phoenix control plane listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal)
            .await?;
        tracing::info!("phoenix control plane shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    #[test]
    fn server_builds_router_from_default_config() {
        let server = ApiServer::with_defaults();
        let _router = server.router();
    }

    #[tokio::test]
    async fn health_endpoint_reachable_through_full_stack() {
        let server = ApiServer::with_defaults();
        let router = server.router();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized_requests() {
        let mut server_config = ServerConfig::default();
        server_config.max_body_size = 1024;
        let config = ApiConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            server: server_config,
        };
        let server = ApiServer::new(config);
        let router = server.router();

        let oversized = vec![b'x'; 4096];
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/experiments")
            .header("content-type", "application/json")
            .body(Body::from(oversized))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
