//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::client::broadcaster::BroadcastPolicy;

/// Relay configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Members allowed in one room
    pub max_room_players: usize,
    /// Time a new connection has to send its `join`
    pub join_timeout: Duration,
    /// Inbound messages per second allowed per connection
    pub input_rate_limit: u32,
    /// Allowed client origins for CORS (comma-separated, `*` for any)
    pub client_origin: String,
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = Self::default();

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_room_players: parse_var("MAX_ROOM_PLAYERS", defaults.max_room_players)?,
            join_timeout: Duration::from_millis(parse_var(
                "JOIN_TIMEOUT_MS",
                defaults.join_timeout.as_millis() as u64,
            )?),
            input_rate_limit: parse_var("INPUT_RATE_LIMIT", defaults.input_rate_limit)?,
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or(defaults.client_origin),
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            max_room_players: 8,
            join_timeout: Duration::from_secs(5),
            input_rate_limit: 60,
            client_origin: "*".to_string(),
        }
    }
}

/// Client-side tuning for a room session
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:8080`
    pub relay_url: String,
    /// Per-tick exponential smoothing factor for remote poses
    pub interpolation_factor: f32,
    /// Minimum time between two position broadcasts
    pub broadcast_interval: Duration,
    pub broadcast_policy: BroadcastPolicy,
    /// Position change (world units) below which an update is not worth sending
    pub position_deadband: f32,
    /// Rotation change (radians) below which an update is not worth sending
    pub rotation_deadband: f32,
    /// Resend an unchanged pose after this long so peers see we are alive
    pub keepalive: Duration,
    /// How long to wait for `player_list` or `error` after sending `join`
    pub join_timeout: Duration,
    /// Room codes tried before `create_room` gives up on collisions
    pub create_attempts: u32,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }

    /// Load client overrides from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let interpolation_factor: f32 =
            parse_var("INTERPOLATION_FACTOR", defaults.interpolation_factor)?;
        if !(interpolation_factor > 0.0 && interpolation_factor <= 1.0) {
            return Err(ConfigError::Invalid("INTERPOLATION_FACTOR"));
        }

        Ok(Self {
            relay_url: env::var("RELAY_URL").unwrap_or(defaults.relay_url),
            interpolation_factor,
            broadcast_interval: Duration::from_millis(parse_var(
                "BROADCAST_INTERVAL_MS",
                defaults.broadcast_interval.as_millis() as u64,
            )?),
            join_timeout: Duration::from_millis(parse_var(
                "JOIN_TIMEOUT_MS",
                defaults.join_timeout.as_millis() as u64,
            )?),
            ..defaults
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            interpolation_factor: 0.15,
            broadcast_interval: Duration::from_millis(50),
            broadcast_policy: BroadcastPolicy::OnChange,
            position_deadband: 0.01,
            rotation_deadband: 0.01,
            keepalive: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
            create_attempts: 8,
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
