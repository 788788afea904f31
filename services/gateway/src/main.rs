use std::sync::Arc;

use anyhow::{Context, Result};
use gatehouse_gateway::config::GatewayConfig;
use gatehouse_gateway::server::GatewayServer;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log_level);

    info!("gatehouse gateway starting");
    info!(
        "routes file: {}, quota backend: {}",
        config.routes_file.display(),
        if config.quota_redis_url.is_some() {
            "redis"
        } else {
            "in-process"
        }
    );

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e);
    }

    let server = Arc::new(
        GatewayServer::new(config)
            .await
            .context("Failed to create gateway server")?,
    );

    spawn_reload_listener(Arc::clone(&server));

    tokio::select! {
        result = Arc::clone(&server).run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    info!("gatehouse gateway stopped");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .compact()
        .init();
}

/// SIGHUP swaps in a freshly-parsed route table; a broken file leaves the
/// running table untouched.
#[cfg(unix)]
fn spawn_reload_listener(server: Arc<GatewayServer>) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };

        while hangup.recv().await.is_some() {
            match server.reload_routes() {
                Ok(count) => info!(routes = count, "route table reloaded"),
                Err(e) => error!("Route reload failed, keeping old table: {:#}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_server: Arc<GatewayServer>) {}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
