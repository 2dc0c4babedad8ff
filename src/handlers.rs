// Clima Agent -- HTTP handlers
//
// Thin axum layer over the dispatcher. JSON-RPC errors are always HTTP 200
// with an `error` member; only transport problems use HTTP status codes.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use utoipa::OpenApi;

use crate::dispatcher::{CacheStatus, Reply};
use crate::error::ApiError;
use crate::rate_limit::CallerKey;
use crate::state::AppState;
use crate::tasks::{TaskId, TaskStatus};

pub const AGENT_ID_HEADER: &str = "x-agent-id";
pub const CACHE_HEADER: &str = "x-cache";
const MAX_AGENT_ID_LEN: usize = 128;

/// Caller identity for rate limiting: the `X-Agent-Id` header when present,
/// else the peer address, else a shared global bucket.
pub fn caller_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> CallerKey {
    let agent = headers
        .get(AGENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_AGENT_ID_LEN);
    match (agent, peer) {
        (Some(id), _) => CallerKey::agent(id),
        (None, Some(addr)) => CallerKey::ip(addr.ip()),
        (None, None) => CallerKey::global(),
    }
}

// ── JSON-RPC ─────────────────────────────────────────────────────────────────

#[utoipa::path(post, path = "/rpc", tag = "rpc",
    request_body(content = Value, description = "JSON-RPC 2.0 request or batch"),
    responses(
        (status = 200, description = "JSON-RPC response or batch of responses", body = Value),
        (status = 204, description = "Only notifications were received")
    )
)]
pub async fn rpc(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let caller = caller_key(request.headers(), peer);

    let body = axum::body::to_bytes(request.into_body(), state.config.max_body_bytes)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Request body could not be read: {e}")))?;

    let response = match state.dispatcher.handle_body(&body, &caller).await {
        Reply::Single(dispatched) => {
            let mut response = Json(dispatched.response).into_response();
            if dispatched.cache != CacheStatus::Bypass {
                response
                    .headers_mut()
                    .insert(CACHE_HEADER, HeaderValue::from_static(dispatched.cache.as_str()));
            }
            response
        }
        Reply::Batch(responses) => Json(responses).into_response(),
        Reply::Empty => StatusCode::NO_CONTENT.into_response(),
    };
    Ok(response)
}

// ── Discovery ────────────────────────────────────────────────────────────────

#[utoipa::path(get, path = "/.well-known/agent.json", tag = "discovery",
    responses((status = 200, description = "Agent card", body = Value))
)]
pub async fn agent_card(State(state): State<AppState>) -> Response {
    Json(state.dispatcher.card()).into_response()
}

// ── Health ───────────────────────────────────────────────────────────────────

#[utoipa::path(get, path = "/health", tag = "health",
    responses((status = 200, description = "Liveness with basic counters", body = Value))
)]
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": if state.is_ready() { "healthy" } else { "starting" },
        "agent_id": state.config.agent_id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "active_tasks": state.dispatcher.tasks().active(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /health/ready -- lightweight readiness check.
#[utoipa::path(get, path = "/health/ready", tag = "health",
    responses(
        (status = 200, description = "Agent ready", body = Value),
        (status = 503, description = "Agent starting or draining", body = Value)
    )
)]
pub async fn readiness(State(state): State<AppState>) -> Response {
    let ready = state.is_ready();
    let body = json!({ "ready": ready, "uptime_seconds": state.start_time.elapsed().as_secs() });
    if ready {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

#[utoipa::path(get, path = "/status", tag = "health",
    responses((status = 200, description = "Breakers, cache, tasks and rate limiter", body = Value))
)]
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let d = &state.dispatcher;
    Json(json!({
        "agent_id": state.config.agent_id,
        "ready": state.is_ready(),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "circuit_breakers": d.breakers().snapshot(),
        "cache": d.cache().stats(),
        "tasks": d.tasks().counts(),
        "rate_limiter": d.limiter().stats(),
    }))
}

// ── Tasks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
}

#[utoipa::path(get, path = "/tasks", tag = "tasks",
    params(("status" = Option<String>, Query, description = "submitted | working | completed | failed")),
    responses(
        (status = 200, description = "All known tasks with their count", body = Value),
        (status = 400, description = "Unknown status filter")
    )
)]
pub async fn list_tasks(State(state): State<AppState>, Query(query): Query<TaskListQuery>) -> Json<Value> {
    let tasks = state.dispatcher.tasks().list(query.status);
    let count = tasks.len();
    Json(json!({ "tasks": tasks, "count": count }))
}

#[utoipa::path(get, path = "/tasks/{id}", tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task snapshot", body = Value),
        (status = 404, description = "Unknown task", body = Value)
    )
)]
pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let task = state
        .dispatcher
        .tasks()
        .get_task(&TaskId::from(id.as_str()))
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    serde_json::to_value(task)
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

// ── OpenAPI ──────────────────────────────────────────────────────────────────

pub async fn openapi() -> Response {
    Json(crate::ApiDoc::openapi()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)), 50123))
    }

    #[test]
    fn agent_header_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(AGENT_ID_HEADER, HeaderValue::from_static(" planner-7 "));
        assert_eq!(caller_key(&headers, peer()).as_str(), "agent:planner-7");
    }

    #[test]
    fn falls_back_to_peer_then_global() {
        let mut headers = HeaderMap::new();
        headers.insert(AGENT_ID_HEADER, HeaderValue::from_static("   "));
        assert_eq!(caller_key(&headers, peer()).as_str(), "ip:192.168.1.7");
        assert_eq!(caller_key(&HeaderMap::new(), None).as_str(), "global");
    }
}
