//! Wire protocol and the relay's WebSocket endpoint

pub mod handler;
pub mod protocol;

pub use handler::ws_handler;
