//! Party Sync - state synchronization for small multiplayer parties
//!
//! Two halves share one wire protocol:
//! - [`client`]: what a game links in. Room lifecycle, smoothed remote poses,
//!   idempotent world events and a throttled pose broadcaster.
//! - [`relay`] / [`app`]: the room relay server that fans messages out between
//!   the members of a room and keeps a snapshot for late joiners.

pub mod app;
pub mod client;
pub mod config;
pub mod http;
pub mod identity;
pub mod relay;
pub mod util;
pub mod ws;

pub use client::{RoomClient, RoomError};
pub use config::{ClientConfig, RelayConfig};
pub use identity::{PlayerId, RoomCode};
pub use ws::protocol::{Message, Pose};
