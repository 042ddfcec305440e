//! Transport runner.
//!
//! Binds a protocol engine to a transport, creates sessions on demand and
//! answers HTTP requests. Embedders call [`HttpServerRunner::handle_request`]
//! once per request; standalone processes call [`HttpServerRunner::run`] to
//! serve through the embedded dev server.

use crate::config::TransportConfig;
use crate::dev_server::DevServer;
use crate::environment::EnvironmentProfile;
use crate::http::{Body, CgiContext, HttpMessage, RequestContext};
use crate::mcp::ProtocolEngine;
use crate::session::{HttpServerSession, SessionError, SessionState};
use crate::transport::{Admission, Transport, TransportError};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for runner operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Transport not started")]
    NotStarted,

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to read request: {0}")]
    Context(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runs one protocol engine over one HTTP transport.
pub struct HttpServerRunner {
    engine: Arc<dyn ProtocolEngine>,
    transport: Arc<dyn Transport>,
    profile: EnvironmentProfile,
    context: Box<dyn RequestContext>,
    /// Live session; the lock also serializes request handling
    session: Mutex<Option<Arc<HttpServerSession>>>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl HttpServerRunner {
    /// Create a runner for the environment the process is running in.
    pub fn new(engine: Arc<dyn ProtocolEngine>, transport: Arc<dyn Transport>) -> Self {
        Self::with_profile(engine, transport, EnvironmentProfile::detect())
    }

    /// Create a runner for a given environment.
    ///
    /// A `shared_hosting` option in the transport configuration takes
    /// precedence over the profile's detection.
    pub fn with_profile(
        engine: Arc<dyn ProtocolEngine>,
        transport: Arc<dyn Transport>,
        profile: EnvironmentProfile,
    ) -> Self {
        let profile = profile.with_shared_hosting(transport.config().shared_hosting);
        Self {
            engine,
            transport,
            profile,
            context: Box::new(CgiContext),
            session: Mutex::new(None),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Replace the source used when `handle_request` gets no request.
    pub fn with_request_context(mut self, context: impl RequestContext + 'static) -> Self {
        self.context = Box::new(context);
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &TransportConfig {
        self.transport.config()
    }

    pub fn profile(&self) -> &EnvironmentProfile {
        &self.profile
    }

    /// The live session, or the last one if it has closed.
    pub async fn session(&self) -> Option<Arc<HttpServerSession>> {
        self.session.lock().await.clone()
    }

    fn create_session(&self) -> Arc<HttpServerSession> {
        let session = HttpServerSession::new(Arc::clone(&self.transport));
        self.engine.set_session(Arc::clone(&session));
        session.register_handlers(self.engine.handlers());
        session.register_notification_handlers(self.engine.notification_handlers());
        debug!("Created session {}", session.id());
        session
    }

    /// Close the live session, if any, and start a new one in its place.
    async fn replace_session(
        &self,
        live: &mut Option<Arc<HttpServerSession>>,
    ) -> Result<Arc<HttpServerSession>> {
        if let Some(stale) = live.take() {
            if !stale.is_closed() {
                info!("Replacing session {}", stale.id());
            }
            if let Err(e) = stale.close().await {
                warn!("Error closing session {}: {}", stale.id(), e);
            }
        }
        let session = self.create_session();
        *live = Some(Arc::clone(&session));
        session.start().await?;
        Ok(session)
    }

    /// Answer one HTTP request.
    ///
    /// Without a request, the current one is read from the runner's request
    /// context (by default the CGI environment).
    pub async fn handle_request(&self, request: Option<HttpMessage>) -> Result<HttpMessage> {
        let mut live = self.session.lock().await;

        if !self.transport.is_started() {
            self.transport.start().await?;
        }

        let request = match request {
            Some(request) => request,
            None => self.context.capture().await.map_err(RunnerError::Context)?,
        };
        debug!("{} {}", request.method, request.path);

        match self.transport.receive_request(request).await? {
            Admission::Reply(response) => return Ok(response),
            Admission::Terminate(response) => {
                if let Some(session) = live.take() {
                    if let Err(e) = session.close().await {
                        warn!("Error closing session {}: {}", session.id(), e);
                    }
                }
                return Ok(response);
            }
            Admission::Accepted => {}
        }

        // Only a request that negotiated SSE joins a live streaming session.
        // Any other request ends it so its replies come back in the body.
        let streaming =
            self.config().is_streaming_enabled() && self.transport.client_requested_sse();
        let timeout = self.config().session_timeout;
        let reusable = live
            .as_ref()
            .filter(|s| {
                streaming && s.state() == SessionState::Streaming && s.age() < timeout
            })
            .cloned();

        let response = match reusable {
            Some(session) => match session.open_stream() {
                Some(response) => response,
                None => {
                    debug!("Session {} ended before its stream opened", session.id());
                    self.respond_with(self.replace_session(&mut live).await?)
                }
            },
            None => self.respond_with(self.replace_session(&mut live).await?),
        };
        Ok(response)
    }

    fn respond_with(&self, session: Arc<HttpServerSession>) -> HttpMessage {
        session
            .open_stream()
            .unwrap_or_else(|| self.transport.take_response())
    }

    /// Write a response in CGI form: status line, headers, blank line, body.
    pub async fn send_response<W>(&self, response: HttpMessage, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let status = response.status;
        let mut head = format!(
            "Status: {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        for (name, value) in response.headers.iter() {
            if let Ok(value) = value.to_str() {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        head.push_str("\r\n");
        writer.write_all(head.as_bytes()).await?;

        match response.body {
            Body::Empty => {}
            Body::Full(text) => writer.write_all(text.as_bytes()).await?,
            Body::Stream(mut rx) => {
                writer.flush().await?;
                while let Some(chunk) = rx.recv().await {
                    writer.write_all(chunk.as_bytes()).await?;
                    writer.flush().await?;
                }
            }
        }
        writer.flush().await?;
        Ok(())
    }

    /// Start serving.
    ///
    /// In a standalone process this runs the dev server until [`stop`] is
    /// called. Otherwise it returns once the transport is ready for
    /// `handle_request`.
    ///
    /// [`stop`]: HttpServerRunner::stop
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            error!("HTTP server failed: {}", e);
            self.stop().await;
        }
        result
    }

    async fn run_inner(self: &Arc<Self>) -> Result<()> {
        self.transport.start().await?;
        {
            let mut live = self.session.lock().await;
            self.replace_session(&mut live).await?;
        }
        info!("HTTP server started");

        if self.profile.is_standalone() {
            let token = CancellationToken::new();
            *self.shutdown.lock() = Some(token.clone());
            DevServer::new(Arc::clone(self), token).serve().await?;
        }
        Ok(())
    }

    /// Stop the dev server, the session and the transport.
    ///
    /// Errors are logged, never returned. Stopping twice is a no-op.
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                error!("Error closing session {}: {}", session.id(), e);
            }
        }

        if let Err(e) = self.transport.stop().await {
            error!("Error stopping transport: {}", e);
        }
        info!("HTTP server stopped");
    }

    /// One step of the drain worker.
    ///
    /// Starts a session for messages that were queued without an HTTP request
    /// to carry them. Returns whether any work was found.
    pub async fn poll_pending(&self) -> Result<bool> {
        let mut live = self.session.lock().await;
        if !self.transport.is_started() {
            return Err(RunnerError::NotStarted);
        }

        // A streaming session drains the queue on its own
        if live.as_ref().is_some_and(|s| !s.is_closed()) {
            return Ok(false);
        }
        if self.transport.pending().await? == 0 {
            return Ok(false);
        }

        self.replace_session(&mut live).await?;
        Ok(true)
    }
}
