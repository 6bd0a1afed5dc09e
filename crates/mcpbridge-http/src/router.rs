//! Route table for the bridge's HTTP surface.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{cleanup, health, health_resources, health_servers, list_mcp, list_tools, post_session};
use crate::state::AppState;
use crate::stream::sse_handler;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/sessions/{id}", post(post_session))
        .route("/health", get(health))
        .route("/health/servers", get(health_servers))
        .route("/health/resources", get(health_resources))
        .route("/listmcp", get(list_mcp))
        .route("/listtools/{server}", get(list_tools))
        .route("/cleanup", post(cleanup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
