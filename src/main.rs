//! Party Sync relay - room relay for small multiplayer parties
//!
//! This is the main entry point for the relay. It serves:
//! - WebSocket connections, one room member each
//! - A health endpoint for the hosting platform

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use party_sync::config::RelayConfig;
use party_sync::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = RelayConfig::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize uptime tracking
    init_server_time();

    info!("Starting Party Sync relay");
    info!(
        max_room_players = config.max_room_players,
        join_timeout_ms = config.join_timeout.as_millis() as u64,
        input_rate_limit = config.input_rate_limit,
        "Relay limits"
    );

    let listener = TcpListener::bind(config.server_addr).await?;
    party_sync::app::serve(listener, config, shutdown_signal()).await?;

    info!("Relay shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
