//! Hosting environment detection.
//!
//! Works out what the process is allowed to do where it runs (keep state
//! between requests, run background workers) and recommends transport
//! options that suit it.

use crate::config::{ConfigOverrides, SessionHandlerKind};
use std::path::Path;
use tracing::debug;

/// Control panels whose presence marks a shared hosting box.
const PANEL_MARKERS: &[&str] = &[
    "/usr/local/cpanel",
    "/usr/local/psa",
    "/usr/local/directadmin",
];

/// Snapshot of the hosting environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentProfile {
    /// Process was started by a web server through the CGI gateway
    pub cgi: bool,
    /// Process runs inside a restrictive shared hosting sandbox
    pub shared_hosting: bool,
    /// Process runs inside a container
    pub container: bool,
}

impl EnvironmentProfile {
    /// Inspect the current process environment.
    pub fn detect() -> Self {
        Self::detect_from(|key| std::env::var(key).ok(), |path| path.exists())
    }

    /// Detection with injectable environment and filesystem lookups.
    pub fn detect_from(
        env: impl Fn(&str) -> Option<String>,
        exists: impl Fn(&Path) -> bool,
    ) -> Self {
        let cgi = env("GATEWAY_INTERFACE").is_some_and(|v| v.starts_with("CGI/"));

        let panel = PANEL_MARKERS.iter().any(|marker| exists(Path::new(marker)));
        let public_html =
            cgi && env("DOCUMENT_ROOT").is_some_and(|root| root.contains("public_html"));
        let shared_hosting = panel || public_html;

        // Docker, Podman and Kubernetes markers
        let container = exists(Path::new("/.dockerenv"))
            || env("container").is_some()
            || env("KUBERNETES_SERVICE_HOST").is_some();

        let profile = Self {
            cgi,
            shared_hosting,
            container,
        };
        debug!("Detected hosting environment: {:?}", profile);
        profile
    }

    /// The profile with shared hosting forced on or off; `None` keeps detection.
    pub fn with_shared_hosting(mut self, forced: Option<bool>) -> Self {
        if let Some(forced) = forced {
            self.shared_hosting = forced;
        }
        self
    }

    /// Whether the process outlives a single HTTP request.
    pub fn can_persist_state(&self) -> bool {
        !self.cgi
    }

    /// Whether background workers (the dev server's drain task) may run.
    pub fn can_spawn_workers(&self) -> bool {
        !self.cgi && !self.shared_hosting
    }

    /// Whether the process was launched directly rather than by a web server.
    pub fn is_standalone(&self) -> bool {
        !self.cgi
    }

    /// Transport options recommended for this environment.
    pub fn recommended(&self) -> ConfigOverrides {
        let mut recommended = ConfigOverrides::default();

        if self.shared_hosting {
            recommended.streaming_enabled = Some(false);
            recommended.max_queue_size = Some(100);
            recommended.session_timeout = Some(1800);
            recommended.session_handler = Some(SessionHandlerKind::File);
        } else if !self.can_persist_state() {
            // A fresh process per request: the queue must live outside it
            recommended.streaming_enabled = Some(false);
            recommended.session_handler = Some(SessionHandlerKind::File);
        } else {
            recommended.streaming_enabled = Some(true);
            recommended.session_handler = Some(SessionHandlerKind::Memory);
        }

        if self.container {
            recommended.host = Some("0.0.0.0".to_string());
        }

        recommended
    }
}
