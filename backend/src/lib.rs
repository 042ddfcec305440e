//! flod: HTTP session lifecycle for MCP JSON-RPC servers.
//!
//! A [`runner::HttpServerRunner`] binds a protocol engine to an HTTP
//! transport. It either answers one request at a time for an embedding web
//! server or CGI process, or runs the embedded dev server in standalone
//! processes.

use axum::Router;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod dev_server;
pub mod environment;
pub mod http;
pub mod mcp;
pub mod runner;
pub mod session;
pub mod storage;
pub mod transport;

use runner::HttpServerRunner;

/// Create the dev server's Axum router.
///
/// This function is used both by the dev server and by integration tests.
pub fn create_app(runner: Arc<HttpServerRunner>) -> Router {
    api::router(runner)
}
