//! Shared types for the flod MCP HTTP runner.
//!
//! This crate contains the JSON-RPC envelope and protocol constants shared
//! between the runner library, its binary and its tests.

/// Default host for the self-hosted development server.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port for the self-hosted development server.
pub const DEFAULT_PORT: u16 = 8080;

/// Path of the protocol endpoint served by the development server.
pub const MCP_ENDPOINT_PATH: &str = "/mcp";

/// Header carrying the transport session identifier.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// MCP protocol version reported during initialization.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub mod jsonrpc;

// Re-export commonly used types
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId, JSONRPC_VERSION,
};
