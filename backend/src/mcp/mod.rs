//! MCP protocol engine.
//!
//! The session and runner only see [`ProtocolEngine`]; [`McpServer`] is the
//! engine the `flod` binary serves, answering `initialize` and `ping` and
//! accepting the lifecycle notifications.

pub mod handler;

pub use handler::{
    HandlerError, HandlerFuture, HandlerMap, McpServer, NotificationHandler,
    NotificationHandlerMap, ProtocolEngine, RequestHandler,
};
