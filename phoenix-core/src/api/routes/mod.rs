//! API Route Handlers
//!
//! Organized by resource: experiments, pipelines, agent protocol, the
//! WebSocket event gateway, and health.

pub mod agent;
pub mod experiments;
pub mod health;
pub mod pipelines;
pub mod ws;

use crate::api::middleware as mw;
use crate::api::AppState;
use axum::{middleware, Router};

/// Assembles the complete router: versioned operator API, the agent
/// protocol surface (guarded by its own auth layer), the WebSocket
/// gateway, and health checks — everything unauthenticated except
/// `/agent/*`.
pub fn api_router(state: AppState) -> Router {
    let v1 = Router::new()
        .nest("/experiments", experiments::routes())
        .nest("/pipelines", pipelines::routes());

    let agent = agent::routes().layer(middleware::from_fn_with_state(
        state.clone(),
        mw::agent_auth_middleware,
    ));

    Router::new()
        .nest("/api/v1", v1)
        .nest("/agent", agent)
        .merge(ws::routes())
        .merge(health::health_routes())
        .with_state(state)
}
