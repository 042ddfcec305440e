//! Dev server routes.

pub mod mcp;

use crate::runner::HttpServerRunner;
use axum::{routing::any, routing::get, Router};
use flod_types::MCP_ENDPOINT_PATH;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the dev server router.
pub fn router(runner: Arc<HttpServerRunner>) -> Router {
    Router::new()
        .route(MCP_ENDPOINT_PATH, any(mcp::mcp_endpoint))
        .route("/health", get(health))
        .fallback(mcp::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(runner)
}

async fn health() -> &'static str {
    "OK"
}
