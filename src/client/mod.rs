//! Game-side half: connection, room lifecycle, remote state and world events

pub mod broadcaster;
pub mod events;
pub mod remote;
pub mod room;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcaster::{BroadcastPolicy, PositionBroadcaster};
pub use events::{SubscriptionId, WorldEvent, WorldEventKind, WorldEventRelay};
pub use remote::{InterpolatedPlayer, RemoteStateStore};
pub use room::{LocalPlayer, RemotePlayer, RoomClient, RoomError};
pub use session::{
    ConnectionError, Connector, SessionError, SessionEvent, SessionState, Transport,
    TransportError, TransportSession, WsConnector, WsTransport,
};
