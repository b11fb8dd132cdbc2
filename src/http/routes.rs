//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, Method},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::relay::RoomSummary;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.client_origin))
        .with_state(state)
}

/// `*` allows any origin, otherwise a comma-separated list
fn cors_layer(client_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed_origins: Vec<header::HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed_origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_rooms: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_rooms: state.rooms.active_rooms(),
        active_players: state.rooms.total_players(),
    })
}

// ============================================================================
// Room stats
// ============================================================================

#[derive(Serialize)]
struct RoomsResponse {
    active_rooms: usize,
    active_players: usize,
    rooms: Vec<RoomSummary>,
}

async fn rooms_handler(State(state): State<AppState>) -> Json<RoomsResponse> {
    let rooms = state.rooms.summaries();
    Json(RoomsResponse {
        active_rooms: rooms.len(),
        active_players: rooms.iter().map(|r| r.players).sum(),
        rooms,
    })
}
