//! Relay side: rooms, their tasks and the registry that finds them

pub mod registry;
pub mod room;

pub use registry::{RegistryError, RoomRegistry, RoomSummary};
pub use room::{ConnectionId, JoinRejected, Room, RoomCommand, RoomHandle, RoomState};
