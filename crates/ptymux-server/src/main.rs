//! ptymux-server: shared PTY sessions over WebSocket.
//!
//! Runs a set of shell sessions on the host and lets any number of browser
//! clients list, create, close, view and type into them.

mod config;
mod hub;
mod router;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::MuxServer;
use session::NativePtySpawner;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long shutdown waits for the hub to signal every PTY.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// ptymux-server: shared PTY sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "ptymux-server", version, about = "Shared PTY sessions over WebSocket")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ptymux/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Scrollback kept per session, in bytes
    #[arg(long)]
    history_capacity: Option<usize>,

    /// Shell to spawn for each session
    #[arg(long)]
    shell: Option<String>,

    /// Command typed into the first session after it starts
    #[arg(long)]
    startup_command: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ptymux-server");

    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_sessions: cli.max_sessions,
        history_capacity: cli.history_capacity,
        shell: cli.shell,
        startup_command: cli.startup_command,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(
        bind = %server_config.bind,
        port = server_config.port,
        shell = %server_config.shell,
        "config loaded"
    );

    let server = MuxServer::new(server_config, Box::new(NativePtySpawner));
    let hub = server.hub_handle();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, hub.shutdown()).await {
        Ok(Ok(signalled)) => info!(signalled, "sessions terminated"),
        Ok(Err(e)) => warn!(error = %e, "hub unavailable during shutdown"),
        Err(_) => warn!("timed out terminating sessions"),
    }

    info!("ptymux-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
