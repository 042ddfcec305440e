//! Streamable HTTP transport backed by a [`MessageStore`].

use super::{Admission, Result, Transport, TransportError};
use crate::config::TransportConfig;
use crate::environment::EnvironmentProfile;
use crate::http::{Body, HttpMessage};
use crate::storage::{self, MessageStore, StoreError};
use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use flod_types::{JsonRpcError, JsonRpcMessage, JsonRpcResponse, MCP_SESSION_ID_HEADER};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Transport for the MCP Streamable HTTP endpoint.
pub struct HttpServerTransport {
    config: Arc<TransportConfig>,
    store: Arc<dyn MessageStore>,
    started: AtomicBool,
    session_id: RwLock<Option<String>>,
    /// Negotiation of the request being handled
    sse_requested: AtomicBool,
    batch: AtomicBool,
    /// Outbound messages waiting for a JSON reply
    outbox: Mutex<Vec<JsonRpcMessage>>,
    /// Sender feeding the open SSE response, if any
    stream: Mutex<Option<mpsc::Sender<String>>>,
}

impl HttpServerTransport {
    /// Create a transport over an existing store.
    pub fn new(config: TransportConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            started: AtomicBool::new(false),
            session_id: RwLock::new(None),
            sse_requested: AtomicBool::new(false),
            batch: AtomicBool::new(false),
            outbox: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
        }
    }

    /// Create a transport with the store its configuration selects.
    pub async fn open(
        config: TransportConfig,
        profile: &EnvironmentProfile,
    ) -> std::result::Result<Self, StoreError> {
        let store = storage::open_store(&config, profile).await?;
        Ok(Self::new(config, store))
    }

    /// Add the headers every response carries.
    fn finish(&self, mut response: HttpMessage) -> HttpMessage {
        response.set_header("server", &self.config.server_header);
        if let Some(id) = self.session_id.read().as_deref() {
            response.set_header(MCP_SESSION_ID_HEADER, id);
        }
        response
    }

    fn error_reply(&self, status: StatusCode, error: JsonRpcError) -> HttpMessage {
        self.finish(HttpMessage::json(status, &JsonRpcResponse::error(None, error)))
    }

    async fn receive_post(&self, request: &HttpMessage) -> Result<Admission> {
        let body = match request.body_text() {
            Some(body) if !body.trim().is_empty() => body,
            _ => {
                return Ok(Admission::Reply(self.error_reply(
                    StatusCode::BAD_REQUEST,
                    JsonRpcError::parse_error("empty body"),
                )))
            }
        };

        let (messages, batch) = match JsonRpcMessage::parse_body(body) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!("Rejecting malformed request body: {}", error);
                return Ok(Admission::Reply(
                    self.error_reply(StatusCode::BAD_REQUEST, error),
                ));
            }
        };
        self.batch.store(batch, Ordering::SeqCst);

        let count = messages.len();
        match self.store.push_all(messages).await {
            Ok(()) => {
                debug!("Queued {} inbound messages", count);
                Ok(Admission::Accepted)
            }
            Err(StoreError::QueueFull { capacity }) => {
                warn!("Pending queue full ({}), rejecting {} messages", capacity, count);
                let mut reply = self.finish(HttpMessage::json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &json!({"error": "Message queue full"}),
                ));
                reply.set_header("retry-after", "1");
                Ok(Admission::Reply(reply))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Keep a message for the next response, dropping the oldest when full.
    ///
    /// Callers hold the stream lock so `open_stream` sees every message.
    fn push_outbox(&self, message: JsonRpcMessage) {
        let mut outbox = self.outbox.lock();
        if !outbox.is_empty() && outbox.len() >= self.config.max_queue_size {
            warn!("Outbox full, dropping oldest outbound message");
            outbox.remove(0);
        }
        outbox.push(message);
    }

    fn event(message: &JsonRpcMessage) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(data) => Some(format!("event: message\ndata: {}\n\n", data)),
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Transport for HttpServerTransport {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Processes sharing the store share the session id
        let id = match self.store.claim_session_id(Uuid::new_v4().to_string()).await {
            Ok(id) => id,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        info!("HTTP transport started (session {})", id);
        *self.session_id.write() = Some(id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the sender ends any open SSE response
        self.stream.lock().take();
        self.outbox.lock().clear();
        *self.session_id.write() = None;
        info!("HTTP transport stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn read_message(&self) -> Result<Option<JsonRpcMessage>> {
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }
        Ok(self.store.pop().await?)
    }

    async fn write_message(&self, message: JsonRpcMessage) -> Result<()> {
        let Some(mut event) = Self::event(&message) else {
            return Ok(());
        };

        loop {
            let sender = {
                let stream = self.stream.lock();
                match stream.as_ref().filter(|s| !s.is_closed()) {
                    Some(sender) => sender.clone(),
                    None => {
                        self.push_outbox(message);
                        return Ok(());
                    }
                }
            };

            match sender.send(event).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(unsent)) => {
                    // The stream may have been replaced meanwhile
                    debug!("SSE client disconnected");
                    event = unsent;
                }
            }
        }
    }

    async fn enqueue(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        Ok(self.store.push_all(messages).await?)
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.store.len().await?)
    }

    async fn receive_request(&self, request: HttpMessage) -> Result<Admission> {
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }

        if let Some(sid) = request.header(MCP_SESSION_ID_HEADER) {
            if self.session_id.read().as_deref() != Some(sid) {
                debug!("Unknown session id: {}", sid);
                return Ok(Admission::Reply(self.finish(HttpMessage::json(
                    StatusCode::NOT_FOUND,
                    &json!({"error": "Session not found"}),
                ))));
            }
        }

        self.sse_requested
            .store(request.accepts_event_stream(), Ordering::SeqCst);
        self.batch.store(false, Ordering::SeqCst);

        match request.method {
            Method::POST => self.receive_post(&request).await,
            Method::GET => {
                if request.accepts_event_stream() {
                    Ok(Admission::Accepted)
                } else {
                    let mut reply = self.finish(HttpMessage::json(
                        StatusCode::METHOD_NOT_ALLOWED,
                        &json!({"error": "GET requires Accept: text/event-stream"}),
                    ));
                    reply.set_header("allow", "GET, POST, DELETE");
                    Ok(Admission::Reply(reply))
                }
            }
            Method::DELETE => {
                let reply = self.finish(HttpMessage::response(StatusCode::NO_CONTENT));
                // Clients must initialize again after terminating
                self.close_stream();
                self.outbox.lock().clear();
                let id = Uuid::new_v4().to_string();
                self.store.replace_session_id(id.clone()).await?;
                info!("Session terminated by client, new session id {}", id);
                *self.session_id.write() = Some(id);
                Ok(Admission::Terminate(reply))
            }
            _ => {
                let mut reply = self.finish(HttpMessage::response(StatusCode::METHOD_NOT_ALLOWED));
                reply.set_header("allow", "GET, POST, DELETE");
                Ok(Admission::Reply(reply))
            }
        }
    }

    fn take_response(&self) -> HttpMessage {
        self.sse_requested.store(false, Ordering::SeqCst);
        let messages = std::mem::take(&mut *self.outbox.lock());

        let response = if messages.is_empty() {
            HttpMessage::response(StatusCode::ACCEPTED)
        } else if self.batch.load(Ordering::SeqCst) || messages.len() > 1 {
            HttpMessage::json(StatusCode::OK, &messages)
        } else {
            HttpMessage::json(StatusCode::OK, &messages[0])
        };
        self.finish(response)
    }

    fn open_stream(&self) -> HttpMessage {
        self.sse_requested.store(false, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.config.max_queue_size.max(1));

        // Outbound messages produced before the stream opened go out first
        let mut stream = self.stream.lock();
        let mut outbox = self.outbox.lock();
        let mut pending = std::mem::take(&mut *outbox).into_iter();
        for message in pending.by_ref() {
            let Some(event) = Self::event(&message) else {
                continue;
            };
            if tx.try_send(event).is_err() {
                warn!("SSE channel full while flushing outbox");
                outbox.push(message);
                break;
            }
        }
        // Whatever did not fit waits for the next response
        outbox.extend(pending);
        drop(outbox);
        *stream = Some(tx);
        drop(stream);
        info!("SSE stream opened");

        let mut response = HttpMessage::response(StatusCode::OK)
            .with_header("content-type", "text/event-stream")
            .with_header("cache-control", "no-cache");
        response.body = Body::Stream(rx);
        self.finish(response)
    }

    fn close_stream(&self) {
        if self.stream.lock().take().is_some() {
            debug!("SSE stream closed");
        }
    }

    fn is_stream_disconnected(&self) -> bool {
        self.stream.lock().as_ref().is_some_and(|s| s.is_closed())
    }

    fn client_requested_sse(&self) -> bool {
        self.sse_requested.load(Ordering::SeqCst)
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }
}
