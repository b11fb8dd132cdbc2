//! Registry of open rooms keyed by room code

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::identity::RoomCode;

use super::room::{Room, RoomHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("room code {0} is already in use")]
    RoomCodeTaken(RoomCode),
}

/// Per-room line of the `/rooms` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub code: RoomCode,
    pub players: usize,
}

pub struct RoomRegistry {
    rooms: DashMap<RoomCode, RoomHandle>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Open a room under `code` and spawn its task
    pub fn create(
        self: &Arc<Self>,
        code: RoomCode,
        max_players: usize,
    ) -> Result<RoomHandle, RegistryError> {
        match self.rooms.entry(code.clone()) {
            Entry::Occupied(_) => Err(RegistryError::RoomCodeTaken(code)),
            Entry::Vacant(slot) => {
                let (room, handle) = Room::new(code, max_players, Arc::clone(self));
                slot.insert(handle.clone());
                tokio::spawn(room.run());
                Ok(handle)
            }
        }
    }

    pub fn get(&self, code: &RoomCode) -> Option<RoomHandle> {
        self.rooms.get(code).map(|r| r.value().clone())
    }

    /// Unregister the room with this code, only if it is still the room `id`
    pub fn remove(&self, code: &RoomCode, id: Uuid) -> Option<RoomHandle> {
        self.rooms
            .remove_if(code, |_, handle| handle.id == id)
            .map(|(_, h)| h)
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }

    /// Open rooms sorted by code
    pub fn summaries(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .rooms
            .iter()
            .map(|r| RoomSummary {
                code: r.key().clone(),
                players: r.value().player_count(),
            })
            .collect();
        rooms.sort_by(|a, b| a.code.cmp(&b.code));
        rooms
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
