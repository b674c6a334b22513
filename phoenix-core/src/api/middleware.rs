//! API middleware: request id propagation, rate limiting, CORS,
//! error-envelope passthrough, and agent authentication.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::api::state::{AppState, RateLimitResult};
use crate::api::types::parse_host_header;
use crate::error::{ErrorBody, ErrorEnvelope};
use crate::model::AgentRecord;

// ============================================================================
// Request ID
// ============================================================================

#[derive(Clone, Debug)]
pub struct RequestId(pub String);

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// ============================================================================
// Rate limiting
// ============================================================================

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let client_id = get_client_id(&headers);

    match state.rate_limiter.check_and_increment(&client_id).await {
        RateLimitResult::Allowed { remaining } => {
            let mut response = next.run(request).await;
            if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                response.headers_mut().insert("x-ratelimit-remaining", value);
            }
            response
        }
        RateLimitResult::Limited { retry_after_secs } => {
            let body = ErrorEnvelope {
                error: ErrorBody {
                    code: "RATE_LIMITED".into(),
                    message: format!("rate limit exceeded, retry after {retry_after_secs}s"),
                    details: None,
                },
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
    }
}

fn get_client_id(headers: &HeaderMap) -> String {
    if let Some(host) = headers.get("x-agent-host-id").and_then(|v| v.to_str().ok()) {
        return format!("host:{host}");
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = forwarded.split(',').next() {
            return format!("ip:{}", ip.trim());
        }
    }
    "ip:unknown".to_string()
}

// ============================================================================
// Agent authentication
// ============================================================================

/// Requires `X-Agent-Host-ID` on every agent-protocol request; absence
/// is a 401. The agent row is upserted (first-contact) on success so
/// handlers never see a host the store doesn't know about.
pub async fn agent_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Response {
    let host_id = match parse_host_header(headers.get("x-agent-host-id").and_then(|v| v.to_str().ok()))
    {
        Some(host_id) => host_id,
        None => {
            let body = ErrorEnvelope {
                error: ErrorBody {
                    code: "UNAUTHORIZED".into(),
                    message: "missing X-Agent-Host-ID header".into(),
                    details: None,
                },
            };
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }
    };

    if state.store.get_agent(&host_id).await.ok().flatten().is_none() {
        let now = chrono::Utc::now();
        let _ = state
            .store
            .upsert_agent(AgentRecord {
                host_id: host_id.clone(),
                hostname: host_id.to_string(),
                address: String::new(),
                version: String::new(),
                first_seen: now,
                last_heartbeat: now,
                health: crate::model::AgentHealth::Healthy,
                capabilities: Default::default(),
                active_task_ids: Vec::new(),
                resource_usage: Default::default(),
            })
            .await;
    }

    request
        .extensions_mut()
        .insert(crate::api::routes::agent::AuthenticatedHost(host_id));
    next.run(request).await
}

// ============================================================================
// CORS
// ============================================================================

pub async fn cors_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    if let Some(origin) = state.config.cors_origins.first() {
        if origin == "*" {
            tracing::warn!("CORS wildcard '*' origin configured; not recommended in production");
        }
        if let Ok(value) = HeaderValue::from_str(origin) {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
        );
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, X-Agent-Host-ID, X-Request-Id"),
        );
    }

    response
}

// ============================================================================
// Error handling
// ============================================================================

/// Placeholder seam for cross-cutting error enrichment (e.g. attaching
/// the request id to 5xx bodies) — currently a passthrough since
/// `PhoenixError::into_response` already produces the full envelope.
pub async fn error_handler_middleware(request: Request, next: Next) -> Response {
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_prefers_agent_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-agent-host-id", "h1".parse().unwrap());
        assert_eq!(get_client_id(&headers), "host:h1");
    }

    #[test]
    fn client_id_falls_back_to_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        assert_eq!(get_client_id(&headers), "ip:1.2.3.4");
    }

    #[test]
    fn client_id_defaults_to_unknown() {
        assert_eq!(get_client_id(&HeaderMap::new()), "ip:unknown");
    }

    #[tokio::test]
    async fn agent_auth_rejects_missing_header() {
        use crate::config::ServerConfig;
        use axum::body::Body;
        use axum::routing::get;
        use axum::Router;
        use tower::ServiceExt;

        let state = AppState::new(ServerConfig::default());
        let app: Router = Router::new()
            .route("/probe", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                agent_auth_middleware,
            ))
            .with_state(state);

        let response = app
            .oneshot(
                axum::http::Request::get("/probe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn agent_auth_upserts_and_admits_known_header() {
        use crate::config::ServerConfig;
        use crate::model::HostId;
        use axum::body::Body;
        use axum::routing::get;
        use axum::Router;
        use tower::ServiceExt;

        let state = AppState::new(ServerConfig::default());
        let app: Router = Router::new()
            .route("/probe", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                agent_auth_middleware,
            ))
            .with_state(state.clone());

        let response = app
            .oneshot(
                axum::http::Request::get("/probe")
                    .header("x-agent-host-id", "h9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.get_agent(&HostId::from("h9")).await.unwrap().is_some());
    }
}
