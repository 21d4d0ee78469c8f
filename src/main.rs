use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use edgeguard::config::ServiceConfig;
use edgeguard::http::HttpServer;
use edgeguard::ratelimit::{select_backend, RateLimitPolicy};

/// Rate limiting guard for abuse-sensitive HTTP endpoints.
#[derive(Debug, Parser)]
#[command(name = "edgeguard", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "EDGEGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Edgeguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        fail_open = config.limiter.fail_open,
        debug = config.limiter.debug,
        "Configuration loaded"
    );

    // The backend is chosen once and shared by every route.
    let backend = select_backend(&config.store);
    let policy = Arc::new(RateLimitPolicy::new(backend, &config.limiter));
    let buckets = config.bucket_registry()?;
    info!(buckets = ?buckets.names(), "Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, policy, buckets);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Edgeguard stopped");
    Ok(())
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
