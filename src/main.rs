use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::HttpServer;
use turnstile::ratelimit::{
    spawn_sweeper, IdentityExtractor, OperatingMode, SystemClock, TierRegistry,
};

/// Tiered request throttling service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the quota regime
    #[arg(long, value_enum)]
    mode: Option<OperatingMode>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Turnstile throttling service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.throttle.mode = mode;
    }
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        mode = %config.throttle.mode,
        "Configuration loaded"
    );

    let registry = Arc::new(TierRegistry::new(&config.throttle, Arc::new(SystemClock))?);
    let extractor = Arc::new(
        IdentityExtractor::new(config.throttle.forwarded.clone())
            .with_ipv6_prefix(config.throttle.ipv6_prefix),
    );
    info!("Tier registry initialized");

    let sweeper = spawn_sweeper(registry.clone(), config.server.sweep_interval());

    let server = HttpServer::new(config.server.http_addr, registry, extractor);
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    info!("Turnstile throttling service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
