//! Configuration management.
//!
//! Transport options are resolved once per runner in three layers: hard
//! defaults, then the environment profile's recommendations (when
//! auto-detection is on), then the caller's explicit overrides.

use crate::environment::EnvironmentProfile;
use anyhow::bail;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use flod_types::{DEFAULT_HOST, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Backend for the transport's pending message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SessionHandlerKind {
    /// Pick one from the environment and the rest of the configuration
    #[default]
    Auto,
    File,
    Database,
    Memory,
}

/// Caller-supplied options.
///
/// Every field is optional; only the ones that are set override the lower
/// layers. Keys the runner does not know are collected in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    /// Session timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_detect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_hosting: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_handler: Option<SessionHandlerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_header: Option<String>,
    /// Streaming idle timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout: Option<u64>,
    /// Poll interval in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Resolved transport configuration.
///
/// Shared behind an `Arc` by the transport and never mutated after
/// resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Maximum age of a session before the runner replaces it
    pub session_timeout: Duration,
    /// Allow long-lived SSE responses
    pub streaming_enabled: bool,
    /// Capacity of the pending message queue and of the SSE channel
    pub max_queue_size: usize,
    /// Whether environment recommendations were applied
    pub auto_detect: bool,
    /// Forced shared hosting mode (None = detect on every query)
    pub shared_hosting: Option<bool>,
    pub session_handler: SessionHandlerKind,
    /// Dev server bind host
    pub host: String,
    /// Dev server bind port
    pub port: u16,
    /// Value of the `Server` response header
    pub server_header: String,
    /// A streaming session closes after this long without inbound traffic
    pub stream_idle_timeout: Duration,
    /// Sleep between empty polls
    pub poll_interval: Duration,
    /// PostgreSQL URL for the database store
    pub database_url: Option<String>,
    /// File used by the file store
    pub queue_path: Option<PathBuf>,
    /// Caller options the runner does not know about
    pub extra: BTreeMap<String, Value>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            streaming_enabled: false,
            max_queue_size: 1000,
            auto_detect: true,
            shared_hosting: None,
            session_handler: SessionHandlerKind::Auto,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            server_header: format!("flod/{}", env!("CARGO_PKG_VERSION")),
            stream_idle_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            database_url: None,
            queue_path: None,
            extra: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    /// Resolve against the environment the process is running in.
    pub fn resolve(overrides: ConfigOverrides) -> Self {
        Self::resolve_with(overrides, &EnvironmentProfile::detect())
    }

    /// Resolve against a given environment profile.
    pub fn resolve_with(overrides: ConfigOverrides, profile: &EnvironmentProfile) -> Self {
        let mut config = Self::default();
        let auto_detect = overrides.auto_detect.unwrap_or(config.auto_detect);
        let profile = profile.clone().with_shared_hosting(overrides.shared_hosting);
        let recommended = auto_detect.then(|| profile.recommended());
        config.merge(recommended, overrides);
        config
    }

    fn merge(&mut self, recommended: Option<ConfigOverrides>, overrides: ConfigOverrides) {
        if let Some(recommended) = recommended {
            debug!("Applying recommended options: {:?}", recommended);
            // Defaults define the legal key set; anything else is dropped
            self.apply(ConfigOverrides {
                extra: BTreeMap::new(),
                ..recommended
            });
        }
        self.apply(overrides);
    }

    fn apply(&mut self, o: ConfigOverrides) {
        if let Some(v) = o.session_timeout {
            self.session_timeout = Duration::from_secs(v);
        }
        if let Some(v) = o.streaming_enabled {
            self.streaming_enabled = v;
        }
        if let Some(v) = o.max_queue_size {
            self.max_queue_size = v;
        }
        if let Some(v) = o.auto_detect {
            self.auto_detect = v;
        }
        if o.shared_hosting.is_some() {
            self.shared_hosting = o.shared_hosting;
        }
        if let Some(v) = o.session_handler {
            self.session_handler = v;
        }
        if let Some(v) = o.host {
            self.host = v;
        }
        if let Some(v) = o.port {
            self.port = v;
        }
        if let Some(v) = o.server_header {
            self.server_header = v;
        }
        if let Some(v) = o.stream_idle_timeout {
            self.stream_idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = o.poll_interval_ms {
            self.poll_interval = Duration::from_millis(v);
        }
        if o.database_url.is_some() {
            self.database_url = o.database_url;
        }
        if o.queue_path.is_some() {
            self.queue_path = o.queue_path;
        }
        self.extra.extend(o.extra);
    }

    pub fn is_streaming_enabled(&self) -> bool {
        self.streaming_enabled
    }

    /// Shared hosting mode, detected afresh on every call unless forced.
    pub fn is_shared_hosting(&self) -> bool {
        match self.shared_hosting {
            Some(forced) => forced,
            None => EnvironmentProfile::detect().shared_hosting,
        }
    }

    /// An option the runner does not know about.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// All options the runner does not know about.
    pub fn extras(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    /// Path of the file store's queue file.
    pub fn queue_file(&self) -> PathBuf {
        self.queue_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("flod").join("pending.json"))
    }

    /// Dev server bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging options for the binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Everything the binary reads from files, environment and command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub transport: ConfigOverrides,
}

impl Settings {
    /// Load settings with full priority chain: CLI args > env vars > config files.
    ///
    /// Config files are searched in this order:
    /// 1. `config.toml` in user config directory (~/.config/flod/ on Linux)
    /// 2. `.flod.toml` in current directory
    /// 3. the file given with `--config`, which must exist
    ///
    /// All layers are explicit overrides for [`TransportConfig::resolve`].
    pub fn load(config_path: Option<&Path>, cli: ConfigOverrides) -> anyhow::Result<Self> {
        let user_config = directories::ProjectDirs::from("", "", "flod")
            .map(|dirs| dirs.config_dir().join("config.toml"));
        let local_config = std::env::current_dir().ok().map(|d| d.join(".flod.toml"));

        let mut figment = Figment::new();

        if let Some(ref path) = user_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        if let Some(ref path) = local_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        if let Some(path) = config_path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        // FLOD_MAX_QUEUE_SIZE -> max_queue_size, FLOD_LOGGING__LOG_LEVEL -> logging.log_level
        figment = figment.merge(Env::prefixed("FLOD_").split("__"));

        figment = figment.merge(Serialized::defaults(Settings {
            logging: LoggingConfig::default(),
            transport: cli,
        }));

        Ok(figment.extract()?)
    }
}
