//! Relay assembly: shared state plus the server loop

mod state;

use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::RelayConfig;
use crate::http::build_router;

pub use state::AppState;

/// Serve the relay on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let state = AppState::new(config);
    let router = build_router(state);

    if let Ok(addr) = listener.local_addr() {
        info!("Relay listening on {}", addr);
        info!("Health check: http://{}/health", addr);
        info!("WebSocket endpoint: ws://{}/ws", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
