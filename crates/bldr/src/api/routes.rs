//! API route definitions.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use crate::runner::runner_ws_handler;
use crate::ws::ws_handler;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api = Router::new()
        .route("/health", get(handlers::health))
        // Projects
        .route(
            "/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route("/projects/{id}", get(handlers::get_project))
        .route("/projects/{id}/messages", get(handlers::project_messages))
        .route("/projects/{id}/generate", post(handlers::generate))
        .route("/projects/{id}/cancel-build", post(handlers::cancel_build))
        // Chat
        .route(
            "/messages",
            get(handlers::list_messages).post(handlers::append_message),
        )
        // Runner ingress without a socket
        .route("/build-events", post(handlers::ingest_build_events))
        // Runner keys
        .route(
            "/runner-keys",
            get(handlers::list_runner_keys).post(handlers::create_runner_key),
        )
        .route("/runner-keys/{id}", delete(handlers::revoke_runner_key))
        // Runner telemetry
        .route("/runners", get(handlers::list_runners))
        // CLI auth bootstrap
        .route("/auth/cli/start", post(handlers::start_cli_auth));

    Router::new()
        .nest("/api", api)
        // Browser fanout and runner transport
        .route("/ws", get(ws_handler))
        .route("/ws/runner", get(runner_ws_handler))
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
