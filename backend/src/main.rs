//! flod server.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use flod::config::{ConfigOverrides, LoggingConfig, SessionHandlerKind, Settings, TransportConfig};
use flod::environment::EnvironmentProfile;
use flod::mcp::McpServer;
use flod::runner::HttpServerRunner;
use flod::transport::HttpServerTransport;

/// flod - MCP over HTTP with session lifecycle management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (TOML), applied after the user and local config files
    #[arg(short, long, env = "FLOD_CONFIG")]
    config: Option<PathBuf>,

    /// Dev server bind host
    #[arg(long)]
    host: Option<String>,

    /// Dev server bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Allow SSE streaming responses
    #[arg(long)]
    streaming: bool,

    /// Capacity of the pending message queue
    #[arg(long)]
    max_queue_size: Option<usize>,

    /// Pending message store
    #[arg(long, value_enum)]
    session_handler: Option<SessionHandlerKind>,

    /// Do not apply the hosting environment's recommendations
    #[arg(long)]
    no_auto_detect: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            streaming_enabled: self.streaming.then_some(true),
            max_queue_size: self.max_queue_size,
            session_handler: self.session_handler,
            auto_detect: self.no_auto_detect.then_some(false),
            ..Default::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref(), args.overrides())?;
    let profile = EnvironmentProfile::detect();

    let _guard = init_logging(&settings.logging, &profile)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(settings.transport, profile))
}

/// Install the tracing subscriber.
///
/// A CGI response goes to stdout, so logs go to stderr there. The returned
/// guard flushes the log file on drop.
fn init_logging(
    logging: &LoggingConfig,
    profile: &EnvironmentProfile,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = match &logging.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let writer = if profile.cgi {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let console = fmt::layer().with_writer(writer).with_target(false).compact();

    let (file_layer, guard) = match &logging.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(UtcTime::new(time::format_description::well_known::Rfc3339));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn serve(overrides: ConfigOverrides, profile: EnvironmentProfile) -> anyhow::Result<()> {
    let config = TransportConfig::resolve_with(overrides, &profile);
    info!(
        "Starting flod {} (cgi: {}, shared hosting: {}, container: {}, streaming: {})",
        env!("CARGO_PKG_VERSION"),
        profile.cgi,
        profile.shared_hosting,
        profile.container,
        config.is_streaming_enabled()
    );

    let transport = HttpServerTransport::open(config, &profile).await?;
    let engine = Arc::new(McpServer::new("flod", env!("CARGO_PKG_VERSION")));
    let runner = Arc::new(HttpServerRunner::with_profile(
        engine,
        Arc::new(transport),
        profile.clone(),
    ));

    if profile.cgi {
        let response = match runner.handle_request(None).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request failed: {}", e);
                flod::http::HttpMessage::json(
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    &serde_json::json!({"error": "Internal server error"}),
                )
            }
        };
        let mut stdout = tokio::io::stdout();
        let sent = runner.send_response(response, &mut stdout).await;
        runner.stop().await;
        return sent.map_err(Into::into);
    }

    let signal_runner = Arc::clone(&runner);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down gracefully...");
        signal_runner.stop().await;
    });

    runner.run().await?;
    runner.stop().await;
    Ok(())
}
