//! Minimal MCP protocol engine.
//!
//! Owns the method and notification handler registries. The session only
//! holds them and calls them by method name.

use crate::session::{HttpServerSession, SessionError};
use flod_types::{JsonRpcError, PROTOCOL_VERSION};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Error returned by a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Answered to the client as a JSON-RPC error response
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),

    /// Not answerable; propagates out of the session
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type HandlerFuture<T> = BoxFuture<'static, Result<T, HandlerError>>;

/// Handler for a request; its value becomes the response `result`.
pub type RequestHandler = Arc<dyn Fn(Option<Value>) -> HandlerFuture<Value> + Send + Sync>;

/// Handler for a notification.
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) -> HandlerFuture<()> + Send + Sync>;

pub type HandlerMap = HashMap<String, RequestHandler>;
pub type NotificationHandlerMap = HashMap<String, NotificationHandler>;

/// The component that gives messages meaning.
pub trait ProtocolEngine: Send + Sync {
    fn handlers(&self) -> HandlerMap;

    fn notification_handlers(&self) -> NotificationHandlerMap;

    /// Called with every session the runner creates, before it starts.
    fn set_session(&self, session: Arc<HttpServerSession>);
}

/// MCP server with `initialize` and `ping` built in.
pub struct McpServer {
    name: String,
    version: String,
    handlers: HandlerMap,
    notification_handlers: NotificationHandlerMap,
    session: RwLock<Option<Arc<HttpServerSession>>>,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            handlers: HashMap::new(),
            notification_handlers: HashMap::new(),
            session: RwLock::new(None),
        }
    }

    /// Register a request handler, replacing any handler for the same method.
    pub fn on_request<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers
            .insert(method.into(), Arc::new(move |params| handler(params).boxed()));
        self
    }

    /// Register a notification handler.
    pub fn on_notification<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.notification_handlers
            .insert(method.into(), Arc::new(move |params| handler(params).boxed()));
        self
    }

    /// Session the server is currently bound to.
    pub fn session(&self) -> Option<Arc<HttpServerSession>> {
        self.session.read().clone()
    }

    /// Send a server-initiated notification on the current session.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        let session = self.session().ok_or(SessionError::Closed)?;
        session.send_notification(method, params).await
    }

    fn initialize_result(&self) -> Value {
        let mut capabilities = json!({});
        if self.handlers.contains_key("tools/list") {
            capabilities["tools"] = json!({});
        }
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities,
            "serverInfo": {
                "name": self.name,
                "version": self.version
            }
        })
    }
}

impl ProtocolEngine for McpServer {
    fn handlers(&self) -> HandlerMap {
        let mut handlers = self.handlers.clone();

        let result = self.initialize_result();
        let initialize: RequestHandler = Arc::new(move |_params: Option<Value>| {
            let result = result.clone();
            async move { Ok::<_, HandlerError>(result) }.boxed()
        });
        let ping: RequestHandler = Arc::new(|_params: Option<Value>| {
            async { Ok::<_, HandlerError>(json!({})) }.boxed()
        });
        handlers
            .entry("initialize".to_string())
            .or_insert(initialize);
        handlers.entry("ping".to_string()).or_insert(ping);
        handlers
    }

    fn notification_handlers(&self) -> NotificationHandlerMap {
        let mut handlers = self.notification_handlers.clone();
        for method in ["notifications/initialized", "notifications/cancelled"] {
            let accept: NotificationHandler = Arc::new(move |_params: Option<Value>| {
                debug!("MCP: {}", method);
                async { Ok::<_, HandlerError>(()) }.boxed()
            });
            handlers.entry(method.to_string()).or_insert(accept);
        }
        handlers
    }

    fn set_session(&self, session: Arc<HttpServerSession>) {
        *self.session.write() = Some(session);
    }
}
