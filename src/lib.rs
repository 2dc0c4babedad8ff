// Clima Agent -- library root
//
// A JSON-RPC 2.0 weather agent: capability dispatch with rate limiting,
// circuit breaking and response caching in front of Open-Meteo, plus an
// asynchronous task store drained by a worker pool.

pub mod a2a_client;
pub mod cache;
pub mod capabilities;
pub mod circuit_breaker;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod reasoner;
pub mod rpc;
pub mod state;
pub mod sweeper;
pub mod tasks;
pub mod weather;

use axum::Router;
use axum::routing::{get, post};
use utoipa::OpenApi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Clima Agent",
        description = "JSON-RPC 2.0 weather agent backed by Open-Meteo"
    ),
    paths(
        handlers::rpc,
        handlers::agent_card,
        handlers::health,
        handlers::readiness,
        handlers::status,
        handlers::list_tasks,
        handlers::get_task,
    ),
    tags(
        (name = "rpc", description = "JSON-RPC 2.0 endpoint"),
        (name = "discovery", description = "Agent card"),
        (name = "health", description = "Liveness, readiness and runtime status"),
        (name = "tasks", description = "Asynchronous task snapshots"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given state.
/// Kept out of `main()` so integration tests can drive it without a socket.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // JSON-RPC
        .route("/rpc", post(handlers::rpc))
        // Discovery
        .route(discovery::WELL_KNOWN_PATH, get(handlers::agent_card))
        // Health
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::readiness))
        .route("/status", get(handlers::status))
        // Tasks
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        // OpenAPI
        .route("/api-docs/openapi.json", get(handlers::openapi))
        .with_state(state)
}
