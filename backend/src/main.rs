//! sluss backend server.

use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, EnvFilter};

use sluss::{config::Config, create_app_with_state, state::AppState, tools};

/// sluss - Resumable Streamable HTTP server for the Model Context Protocol
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides config files and environment)
    #[arg(long)]
    port: Option<u16>,

    /// Force buffered JSON responses even for SSE-capable clients
    #[arg(long)]
    json_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Write logs to this file in addition to stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_figment(
        args.port,
        args.json_only.then_some(true),
        args.log_level,
        args.log_file,
    )?;

    // The guard must stay alive for file logging to flush.
    let _log_guard = init_logging(&config);

    info!("Starting sluss MCP server...");

    let (tools, resources) = tools::demo_registry()?;
    let state = AppState::new(tools, resources, config.runtime_options());
    let app = create_app_with_state(state.clone()).await;

    // Reap idle sessions in the background
    state
        .sessions()
        .spawn_reaper(config.runtime_options().idle_timeout);

    // Bind to 0.0.0.0 to be accessible from all interfaces (Docker, network, etc.)
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C, shutting down gracefully...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

/// Initialize logging from config: RUST_LOG (or `log_level`) controls
/// verbosity; `log_file` adds a file writer alongside stdout.
fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match &config.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_os_string())
                .unwrap_or_else(|| "sluss.log".into());
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .with_writer(writer.and(std::io::stdout))
                .init();
            Some(guard)
        }
        None => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .init();
            None
        }
    }
}
