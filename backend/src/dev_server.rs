//! Embedded development server.
//!
//! Two tasks share one runner: an axum listener answering `/mcp`, and a drain
//! worker that starts sessions for messages queued without a request to carry
//! them. They meet only in the runner's transport store.

use crate::api;
use crate::runner::{HttpServerRunner, Result, RunnerError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct DevServer {
    runner: Arc<HttpServerRunner>,
    shutdown: CancellationToken,
}

impl DevServer {
    pub fn new(runner: Arc<HttpServerRunner>, shutdown: CancellationToken) -> Self {
        Self { runner, shutdown }
    }

    /// Serve until the shutdown token is cancelled.
    ///
    /// Returns immediately when the environment cannot run a background
    /// worker next to the listener.
    pub async fn serve(self) -> Result<()> {
        let profile = self.runner.profile();
        if !profile.is_standalone() || !profile.can_spawn_workers() {
            error!(
                "Dev server unavailable in this environment (cgi: {}, shared hosting: {})",
                profile.cgi, profile.shared_hosting
            );
            return Ok(());
        }

        let addr = self.runner.config().bind_address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| RunnerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("Dev server listening on http://{}/mcp", addr);

        let worker = tokio::spawn(drain_loop(
            Arc::clone(&self.runner),
            self.shutdown.clone(),
        ));

        let app = api::router(Arc::clone(&self.runner));
        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        // The worker must not outlive the listener
        self.shutdown.cancel();
        if let Err(e) = worker.await {
            warn!("Drain worker ended abnormally: {}", e);
        }
        info!("Dev server stopped");
        served.map_err(RunnerError::from)
    }
}

/// Poll the runner for queued work until cancelled.
async fn drain_loop(runner: Arc<HttpServerRunner>, shutdown: CancellationToken) {
    let poll_interval = runner.config().poll_interval;
    debug!("Drain worker started");

    loop {
        let found = match runner.poll_pending().await {
            Ok(found) => found,
            Err(RunnerError::NotStarted) => {
                debug!("Transport stopped, drain worker exiting");
                break;
            }
            Err(e) => {
                error!("Drain worker error: {}", e);
                false
            }
        };

        if found {
            continue;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!("Drain worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::environment::EnvironmentProfile;
    use crate::mcp::McpServer;
    use crate::storage::MemoryStore;
    use crate::transport::HttpServerTransport;
    use flod_types::JsonRpcNotification;
    use std::time::Duration;

    fn runner(profile: EnvironmentProfile) -> Arc<HttpServerRunner> {
        runner_forcing(profile, None)
    }

    fn runner_forcing(
        profile: EnvironmentProfile,
        shared_hosting: Option<bool>,
    ) -> Arc<HttpServerRunner> {
        let config = TransportConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            poll_interval: Duration::from_millis(5),
            shared_hosting,
            ..Default::default()
        };
        let transport = HttpServerTransport::new(config, Arc::new(MemoryStore::new(10)));
        Arc::new(HttpServerRunner::with_profile(
            Arc::new(McpServer::new("test", "0.0.0")),
            Arc::new(transport),
            profile,
        ))
    }

    #[tokio::test]
    async fn test_refuses_without_workers() {
        let shared = EnvironmentProfile {
            shared_hosting: true,
            ..Default::default()
        };
        let token = CancellationToken::new();
        // Returns without binding or waiting for the token
        DevServer::new(runner(shared), token).serve().await.unwrap();

        // Forced on for a plain process
        let token = CancellationToken::new();
        let forced = runner_forcing(EnvironmentProfile::default(), Some(true));
        DevServer::new(forced, token).serve().await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_when_shared_hosting_forced_off() {
        let shared = EnvironmentProfile {
            shared_hosting: true,
            ..Default::default()
        };
        let runner = runner_forcing(shared, Some(false));
        runner.transport().start().await.unwrap();

        let token = CancellationToken::new();
        let server = tokio::spawn(DevServer::new(Arc::clone(&runner), token.clone()).serve());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_drain_worker_consumes_queue_and_stops() {
        let runner = runner(EnvironmentProfile::default());
        runner.transport().start().await.unwrap();
        runner
            .transport()
            .enqueue(vec![
                JsonRpcNotification::new("notifications/initialized", None).into(),
            ])
            .await
            .unwrap();

        let token = CancellationToken::new();
        let worker = tokio::spawn(drain_loop(Arc::clone(&runner), token.clone()));

        for _ in 0..100 {
            if runner.transport().pending().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runner.transport().pending().await.unwrap(), 0);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let runner = runner(EnvironmentProfile::default());
        runner.transport().start().await.unwrap();

        let token = CancellationToken::new();
        let server = tokio::spawn(DevServer::new(Arc::clone(&runner), token.clone()).serve());
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
