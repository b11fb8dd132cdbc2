//! Application state shared across routes

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::relay::RoomRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub rooms: Arc<RoomRegistry>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::new(RoomRegistry::new()),
        }
    }
}
