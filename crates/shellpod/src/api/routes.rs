//! API route definitions.

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use super::terminal;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let session_routes = Router::new()
        .route(
            "/sessions/{session_id}",
            delete(handlers::destroy_session),
        )
        .route(
            "/sessions/{session_id}/_internal/setIdentity",
            post(handlers::set_identity),
        )
        .route(
            "/sessions/{session_id}/_internal/getIdentity",
            get(handlers::get_identity),
        )
        .route("/sessions/{session_id}/start", post(handlers::start_session))
        .route("/sessions/{session_id}/status", get(handlers::session_status))
        .route("/sessions/{session_id}/health", get(handlers::session_health))
        .route(
            "/sessions/{session_id}/activity",
            get(handlers::session_activity),
        )
        .route(
            "/sessions/{session_id}/terminals/{terminal_id}/ws",
            get(terminal::terminal_ws),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .merge(session_routes)
        .layer(trace_layer)
        .with_state(state)
}
