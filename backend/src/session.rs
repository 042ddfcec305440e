//! Session lifecycle.
//!
//! A session is one protocol conversation bound to one transport. It moves
//! through `Uninitialized -> Initialized -> (Streaming | Draining) -> Closed`:
//! a draining session dispatches whatever is queued and closes, a streaming
//! session keeps polling the transport on its own task until it is closed,
//! goes idle for `stream_idle_timeout`, or loses its SSE client. Leaving the
//! streaming state ends the SSE response.

use crate::http::HttpMessage;
use crate::mcp::{HandlerError, HandlerMap, NotificationHandlerMap};
use crate::transport::{Transport, TransportError};
use flod_types::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long `close` waits for the streaming loop before aborting it.
const STREAM_STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Streaming,
    Draining,
    Closed,
}

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handler for '{method}' failed: {source}")]
    Dispatch {
        method: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Streaming task failed: {0}")]
    Task(String),
}

/// A protocol session served over HTTP.
pub struct HttpServerSession {
    id: String,
    created_at: Instant,
    transport: Arc<dyn Transport>,
    state: RwLock<SessionState>,
    handlers: RwLock<HandlerMap>,
    notification_handlers: RwLock<NotificationHandlerMap>,
    stream_task: Mutex<Option<JoinHandle<Result<(), SessionError>>>>,
}

impl HttpServerSession {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            created_at: Instant::now(),
            transport,
            state: RwLock::new(SessionState::Uninitialized),
            handlers: RwLock::new(HandlerMap::new()),
            notification_handlers: RwLock::new(NotificationHandlerMap::new()),
            stream_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn register_handlers(&self, handlers: HandlerMap) {
        self.handlers.write().extend(handlers);
    }

    pub fn register_notification_handlers(&self, handlers: NotificationHandlerMap) {
        self.notification_handlers.write().extend(handlers);
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        // Closed is terminal
        if *current != SessionState::Closed {
            *current = state;
        }
    }

    /// Move to `Closed`, ending the event stream of a streaming session.
    ///
    /// Returns whether the session was still open.
    fn finish(&self) -> bool {
        let mut state = self.state.write();
        let previous = std::mem::replace(&mut *state, SessionState::Closed);
        if previous == SessionState::Streaming {
            self.transport.close_stream();
        }
        previous != SessionState::Closed
    }

    /// Answer the current request with the transport's event stream.
    ///
    /// `None` once the session has left the streaming state.
    pub fn open_stream(&self) -> Option<HttpMessage> {
        // Holding the state lock keeps `finish` from racing the new stream
        let state = self.state.read();
        (*state == SessionState::Streaming).then(|| self.transport.open_stream())
    }

    /// Start processing.
    ///
    /// A streaming session returns as soon as its loop is spawned. A draining
    /// session returns after the queue is empty and the session is closed.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let mut state = self.state.write();
            if *state != SessionState::Uninitialized {
                return Err(SessionError::AlreadyStarted);
            }
            *state = SessionState::Initialized;
        }

        let streaming = self.transport.config().is_streaming_enabled()
            && self.transport.client_requested_sse();

        if streaming {
            self.set_state(SessionState::Streaming);
            info!("Session {} streaming", self.id);
            let session = Arc::clone(self);
            let handle = tokio::spawn(async move { session.stream_loop().await });
            *self.stream_task.lock() = Some(handle);
            Ok(())
        } else {
            self.set_state(SessionState::Draining);
            let result = self.drain().await;
            self.set_state(SessionState::Closed);
            match &result {
                Ok(count) => debug!("Session {} drained {} messages", self.id, count),
                Err(e) => error!("Session {} failed while draining: {}", self.id, e),
            }
            result.map(|_| ())
        }
    }

    /// Dispatch queued messages until the transport has none left.
    async fn drain(&self) -> Result<usize, SessionError> {
        let mut handled = 0;
        while let Some(message) = self.transport.read_message().await? {
            self.handle_incoming_message(message).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn stream_loop(self: Arc<Self>) -> Result<(), SessionError> {
        let config = self.transport.config();
        let idle_timeout = config.stream_idle_timeout;
        let poll_interval = config.poll_interval;
        let mut last_activity = Instant::now();

        let result = loop {
            if self.state() != SessionState::Streaming {
                break Ok(());
            }
            match self.poll_once().await {
                Ok(true) => last_activity = Instant::now(),
                Ok(false) => {
                    if self.transport.is_stream_disconnected() {
                        info!("Session {} lost its event stream client", self.id);
                        break Ok(());
                    }
                    if last_activity.elapsed() >= idle_timeout {
                        info!("Session {} idle for {:?}, closing", self.id, idle_timeout);
                        break Ok(());
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Err(SessionError::Closed) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.finish();
        if let Err(e) = &result {
            error!("Session {} streaming loop failed: {}", self.id, e);
        }
        result
    }

    /// Read and dispatch at most one message.
    ///
    /// Returns `false` when nothing was queued.
    pub async fn poll_once(&self) -> Result<bool, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match self.transport.read_message().await? {
            Some(message) => {
                self.handle_incoming_message(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close the session. Closing twice is a no-op.
    ///
    /// Returns the streaming loop's error if it failed.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.finish() {
            info!("Session {} closed", self.id);
        }

        let Some(mut handle) = self.stream_task.lock().take() else {
            return Ok(());
        };
        // The loop can be stuck writing to a client that stopped reading
        match tokio::time::timeout(STREAM_STOP_GRACE, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SessionError::Task(e.to_string())),
            Err(_) => {
                handle.abort();
                Err(SessionError::Task(format!(
                    "streaming loop did not stop within {:?}",
                    STREAM_STOP_GRACE
                )))
            }
        }
    }

    /// Route one inbound message to its handler and write any reply.
    pub async fn handle_incoming_message(
        &self,
        message: JsonRpcMessage,
    ) -> Result<(), SessionError> {
        match message {
            JsonRpcMessage::Request(JsonRpcRequest {
                id, method, params, ..
            }) => {
                debug!("Session {}: request {} ({})", self.id, method, id);
                let handler = self.handlers.read().get(&method).cloned();
                let response = match handler {
                    Some(handler) => match handler(params).await {
                        Ok(result) => JsonRpcResponse::success(Some(id), result),
                        Err(HandlerError::Rpc(error)) => JsonRpcResponse::error(Some(id), error),
                        Err(HandlerError::Internal(source)) => {
                            return Err(SessionError::Dispatch { method, source })
                        }
                    },
                    None => {
                        debug!("No handler for method: {}", method);
                        JsonRpcResponse::error(Some(id), JsonRpcError::method_not_found(&method))
                    }
                };
                self.transport.write_message(response.into()).await?;
            }
            JsonRpcMessage::Notification(JsonRpcNotification { method, params, .. }) => {
                let handler = self.notification_handlers.read().get(&method).cloned();
                match handler {
                    Some(handler) => match handler(params).await {
                        Ok(()) => {}
                        Err(HandlerError::Rpc(error)) => {
                            warn!("Notification {} rejected: {}", method, error)
                        }
                        Err(HandlerError::Internal(source)) => {
                            return Err(SessionError::Dispatch { method, source })
                        }
                    },
                    None => debug!("Ignoring notification without handler: {}", method),
                }
            }
            JsonRpcMessage::Response(response) => {
                debug!(
                    "Session {}: dropping client response {:?}",
                    self.id, response.id
                );
            }
        }
        Ok(())
    }

    /// Send a server-initiated notification.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let notification = JsonRpcNotification::new(method, params);
        self.transport.write_message(notification.into()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for HttpServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
