//! procmux daemon
//!
//! Supervises local processes and streams their output and lifecycle events
//! to WebSocket subscribers.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use procmux_core::tracing_init::{default_filter, init_tracing};
use procmux_daemon::server::{DaemonServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "procmux-daemon")]
#[command(version, about = "procmux daemon - process supervisor with a WebSocket event hub")]
struct Args {
    /// TCP bind address (overrides the configured bind address and port)
    #[arg(long, env = "PROCMUX_ADDR")]
    addr: Option<SocketAddr>,

    /// Directory whose `.procmux/settings.json` is layered over the global config
    #[arg(long, env = "PROCMUX_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "PROCMUX_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PROCMUX_LOG_JSON")]
    log_json: bool,

    /// Captured output kept per process, in bytes
    #[arg(long, env = "PROCMUX_OUTPUT_BUFFER_BYTES")]
    output_buffer_bytes: Option<usize>,

    /// Outbound messages queued per WebSocket client before it is disconnected
    #[arg(long, env = "PROCMUX_CLIENT_QUEUE_CAPACITY")]
    client_queue_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config = procmux_core::config::load_config(Some(project_dir.as_path()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.daemon.log_level);
    init_tracing(&default_filter(env!("CARGO_PKG_NAME"), log_level), args.log_json);

    let mut server_config = ServerConfig::from_config(&config);
    if let Some(addr) = args.addr {
        server_config = server_config.with_addr(addr);
    }
    if let Some(bytes) = args.output_buffer_bytes {
        server_config = server_config.with_output_buffer_bytes(bytes);
    }
    if let Some(capacity) = args.client_queue_capacity {
        server_config = server_config.with_client_queue_capacity(capacity);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.addr,
        output_buffer_bytes = server_config.supervisor.output_buffer_bytes,
        client_queue_capacity = server_config.hub.client_queue_capacity,
        "Starting procmux-daemon"
    );

    let listener = tokio::net::TcpListener::bind(server_config.addr).await?;
    let server = DaemonServer::new(server_config).await;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // The `true` parameter unsets $NOTIFY_SOCKET so supervised processes
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let shutdown = async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
            }
        }
    };

    server.serve(listener, shutdown).await?;

    info!("Daemon stopped");
    Ok(())
}
