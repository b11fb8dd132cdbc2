//! WebSocket protocol message definitions
//! These are the wire types shared by the relay and its clients

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::identity::PlayerId;

/// Position plus yaw (radians). Characters only rotate about the vertical axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub rotation: f32,
}

impl Pose {
    pub const fn new(x: f32, y: f32, z: f32, rotation: f32) -> Self {
        Self { x, y, z, rotation }
    }

    /// Straight-line distance between the positions, ignoring rotation
    pub fn distance(&self, other: &Pose) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Every message exchanged between clients and the relay.
///
/// Most variants are sent by a client and fanned out unchanged to the other
/// room members. `PlayerList`, `SyncState` and `Error` only ever come from the
/// relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// First message on every connection
    Join {
        player_id: PlayerId,
        name: String,
        character_variant: String,
    },

    Leave {
        player_id: PlayerId,
    },

    Position {
        player_id: PlayerId,
        x: f32,
        y: f32,
        z: f32,
        rotation: f32,
    },

    /// Attack animation started (rising edge)
    Attack {
        player_id: PlayerId,
    },

    /// Attack animation finished (falling edge)
    AttackEnd {
        player_id: PlayerId,
    },

    /// Destructible balloons removed from the world
    BalloonPop {
        balloon_ids: Vec<String>,
        popped_by: PlayerId,
    },

    GemCollect {
        gem_id: String,
        collected_by: PlayerId,
    },

    LevelChange {
        level: u32,
    },

    GameStart,

    CharacterUpdate {
        player_id: PlayerId,
        character_variant: String,
    },

    /// Lobby ready toggle
    Ready {
        player_id: PlayerId,
        ready: bool,
    },

    /// Ask the relay for a fresh `SyncState`
    RequestSync,

    /// Full roster replace
    PlayerList {
        players: Vec<PlayerInfo>,
        host_id: Option<PlayerId>,
    },

    /// Full room snapshot for late joiners and desync recovery
    SyncState {
        state: GameSyncState,
    },

    /// Join/create rejection
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    pub fn position(player_id: PlayerId, pose: Pose) -> Self {
        Self::Position {
            player_id,
            x: pose.x,
            y: pose.y,
            z: pose.z,
            rotation: pose.rotation,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// True for messages only the relay may send
    pub fn is_relay_only(&self) -> bool {
        matches!(
            self,
            Self::PlayerList { .. } | Self::SyncState { .. } | Self::Error { .. }
        )
    }

    /// Player the message claims to come from, if it names one
    pub fn author(&self) -> Option<&PlayerId> {
        match self {
            Self::Join { player_id, .. }
            | Self::Leave { player_id }
            | Self::Position { player_id, .. }
            | Self::Attack { player_id }
            | Self::AttackEnd { player_id }
            | Self::CharacterUpdate { player_id, .. }
            | Self::Ready { player_id, .. } => Some(player_id),
            Self::BalloonPop { popped_by, .. } => Some(popped_by),
            Self::GemCollect { collected_by, .. } => Some(collected_by),
            _ => None,
        }
    }

    /// Wire tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Position { .. } => "position",
            Self::Attack { .. } => "attack",
            Self::AttackEnd { .. } => "attack_end",
            Self::BalloonPop { .. } => "balloon_pop",
            Self::GemCollect { .. } => "gem_collect",
            Self::LevelChange { .. } => "level_change",
            Self::GameStart => "game_start",
            Self::CharacterUpdate { .. } => "character_update",
            Self::Ready { .. } => "ready",
            Self::RequestSync => "request_sync",
            Self::PlayerList { .. } => "player_list",
            Self::SyncState { .. } => "sync_state",
            Self::Error { .. } => "error",
        }
    }
}

/// Roster entry as sent in `player_list` and `sync_state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub name: String,
    pub character_variant: String,
    #[serde(default)]
    pub ready: bool,
}

/// Room-wide snapshot used for late-join catch-up and desync recovery
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSyncState {
    pub host_id: Option<PlayerId>,
    #[serde(default)]
    pub players: Vec<PlayerInfo>,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub game_started: bool,
    #[serde(default)]
    pub popped_balloons: BTreeSet<String>,
    #[serde(default)]
    pub collected_gems: BTreeSet<String>,
}

/// Machine-readable reason carried by `Message::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    /// Create requested for a code that is already open
    RoomCodeTaken,
    InvalidRoomCode,
    /// Another member already uses this player id
    DuplicatePlayer,
    /// First frame on the connection was not a `join`
    JoinRequired,
    JoinTimeout,
}
