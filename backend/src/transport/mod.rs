//! Transport between HTTP requests and the session.
//!
//! A transport turns HTTP requests into queued inbound messages, hands them
//! to the session one at a time, and turns the session's outbound messages
//! back into an HTTP response: one JSON body, or an SSE stream.

mod http_transport;
#[cfg(test)]
pub(crate) mod mock;

pub use http_transport::HttpServerTransport;

use crate::config::TransportConfig;
use crate::http::HttpMessage;
use crate::storage::StoreError;
use async_trait::async_trait;
use flod_types::JsonRpcMessage;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not started")]
    NotStarted,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outcome of handing an HTTP request to the transport.
#[derive(Debug)]
pub enum Admission {
    /// Inbound messages (if any) were queued; the session should run.
    Accepted,
    /// The transport answered the request itself.
    Reply(HttpMessage),
    /// The client ended the session; close it and send this response.
    Terminate(HttpMessage),
}

/// HTTP transport used by the session and the runner.
///
/// Handling one HTTP request is split in two: [`Transport::receive_request`]
/// ingests it, the session drains the queue, then [`Transport::take_response`]
/// or [`Transport::open_stream`] produces the reply.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Stop the transport. Stopping a stopped transport is a no-op.
    async fn stop(&self) -> Result<()>;

    fn is_started(&self) -> bool;

    /// Next inbound message without waiting; `None` when nothing is queued.
    async fn read_message(&self) -> Result<Option<JsonRpcMessage>>;

    /// Send an outbound message to the client.
    ///
    /// Goes to the open SSE stream when there is one. Otherwise, or when its
    /// client went away, the message waits for the next response.
    async fn write_message(&self, message: JsonRpcMessage) -> Result<()>;

    /// Queue inbound messages that did not arrive through an HTTP request.
    async fn enqueue(&self, messages: Vec<JsonRpcMessage>) -> Result<()>;

    /// Number of queued inbound messages.
    async fn pending(&self) -> Result<usize>;

    async fn receive_request(&self, request: HttpMessage) -> Result<Admission>;

    /// Reply for the current request from the collected outbound messages.
    fn take_response(&self) -> HttpMessage;

    /// Reply for the current request as an SSE stream fed by `write_message`.
    ///
    /// Replaces any stream opened by an earlier request.
    fn open_stream(&self) -> HttpMessage;

    /// End the open SSE stream, if any.
    fn close_stream(&self);

    /// Whether an SSE stream was opened and its client has since gone away.
    fn is_stream_disconnected(&self) -> bool;

    /// Whether the current request asked for an SSE response.
    fn client_requested_sse(&self) -> bool;

    fn config(&self) -> &TransportConfig;

    /// Identifier handed to clients in the `Mcp-Session-Id` header.
    fn session_id(&self) -> Option<String>;
}
