//! Room state and the per-room relay task

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::{PlayerId, RoomCode};
use crate::ws::protocol::{ErrorCode, GameSyncState, Message, PlayerInfo};

use super::registry::RoomRegistry;

/// Per-connection id assigned by the WebSocket handler
pub type ConnectionId = Uuid;

/// Messages queued for one connection's writer
pub type Outbox = mpsc::UnboundedSender<Message>;

/// Why a join was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRejected {
    pub code: ErrorCode,
    pub message: String,
}

/// Input to a room task
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        conn_id: ConnectionId,
        player: PlayerInfo,
        outbox: Outbox,
        reply: oneshot::Sender<Result<(), JoinRejected>>,
    },
    Relay {
        conn_id: ConnectionId,
        msg: Message,
    },
    Disconnect {
        conn_id: ConnectionId,
    },
}

#[derive(Debug)]
struct Member {
    conn_id: ConnectionId,
    info: PlayerInfo,
    outbox: Outbox,
}

/// Authoritative room state (owned by the room task)
#[derive(Debug)]
pub struct RoomState {
    code: RoomCode,
    max_players: usize,
    /// Join order
    members: Vec<Member>,
    host_id: Option<PlayerId>,
    level: u32,
    game_started: bool,
    popped_balloons: BTreeSet<String>,
    collected_gems: BTreeSet<String>,
}

impl RoomState {
    pub fn new(code: RoomCode, max_players: usize) -> Self {
        Self {
            code,
            max_players: max_players.max(1),
            members: Vec::new(),
            host_id: None,
            level: 0,
            game_started: false,
            popped_balloons: BTreeSet::new(),
            collected_gems: BTreeSet::new(),
        }
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn host_id(&self) -> Option<&PlayerId> {
        self.host_id.as_ref()
    }

    /// Admit a player. On success everyone gets the new roster and the joiner
    /// gets a full snapshot.
    pub fn join(
        &mut self,
        conn_id: ConnectionId,
        player: PlayerInfo,
        outbox: Outbox,
    ) -> Result<(), JoinRejected> {
        if self.members.len() >= self.max_players {
            return Err(JoinRejected {
                code: ErrorCode::RoomFull,
                message: format!("room {} is full ({} players)", self.code, self.max_players),
            });
        }
        if self.members.iter().any(|m| m.info.player_id == player.player_id) {
            return Err(JoinRejected {
                code: ErrorCode::DuplicatePlayer,
                message: format!("player {} is already in room {}", player.player_id, self.code),
            });
        }

        // First member hosts; the host does not migrate
        if self.host_id.is_none() {
            self.host_id = Some(player.player_id.clone());
        }

        info!(
            room = %self.code,
            player_id = %player.player_id,
            player_count = self.members.len() + 1,
            "Player joined room"
        );

        self.members.push(Member {
            conn_id,
            info: player,
            outbox,
        });

        self.broadcast_player_list();
        let snapshot = Message::SyncState {
            state: self.sync_state(),
        };
        self.send_to(conn_id, snapshot);
        Ok(())
    }

    /// Remove a connection; returns true if it was a member
    pub fn leave(&mut self, conn_id: ConnectionId) -> bool {
        let Some(index) = self.members.iter().position(|m| m.conn_id == conn_id) else {
            return false;
        };
        let member = self.members.remove(index);
        info!(
            room = %self.code,
            player_id = %member.info.player_id,
            player_count = self.members.len(),
            "Player left room"
        );

        self.fan_out(
            conn_id,
            &Message::Leave {
                player_id: member.info.player_id,
            },
        );
        self.broadcast_player_list();
        true
    }

    /// Apply a message from a member and forward it to the others
    pub fn handle(&mut self, conn_id: ConnectionId, msg: Message) {
        let Some(sender) = self.members.iter().find(|m| m.conn_id == conn_id) else {
            debug!(room = %self.code, kind = msg.kind(), "Message from non-member, dropping");
            return;
        };
        let sender_id = sender.info.player_id.clone();

        if msg.is_relay_only() {
            warn!(room = %self.code, player_id = %sender_id, kind = msg.kind(), "Protocol violation, dropping message");
            return;
        }
        if let Some(author) = msg.author() {
            if author != &sender_id {
                warn!(
                    room = %self.code,
                    player_id = %sender_id,
                    claimed = %author,
                    kind = msg.kind(),
                    "Message names another player, dropping"
                );
                return;
            }
        }

        match &msg {
            Message::Join { .. } => {
                warn!(room = %self.code, player_id = %sender_id, "Repeated join, dropping");
                return;
            }
            Message::Leave { .. } => {
                self.leave(conn_id);
                return;
            }
            Message::RequestSync => {
                let snapshot = Message::SyncState {
                    state: self.sync_state(),
                };
                self.send_to(conn_id, snapshot);
                return;
            }
            Message::GameStart => {
                if self.host_id.as_ref() != Some(&sender_id) {
                    warn!(room = %self.code, player_id = %sender_id, "Non-host tried to start the game");
                    return;
                }
                self.game_started = true;
                info!(room = %self.code, "Game started");
            }
            Message::BalloonPop { balloon_ids, .. } => {
                self.popped_balloons.extend(balloon_ids.iter().cloned());
            }
            Message::GemCollect { gem_id, .. } => {
                self.collected_gems.insert(gem_id.clone());
            }
            Message::LevelChange { level } => {
                if *level != self.level {
                    self.level = *level;
                    self.popped_balloons.clear();
                    self.collected_gems.clear();
                }
            }
            Message::CharacterUpdate {
                character_variant, ..
            } => {
                self.update_member(conn_id, |info| {
                    info.character_variant = character_variant.clone()
                });
            }
            Message::Ready { ready, .. } => {
                self.update_member(conn_id, |info| info.ready = *ready);
            }
            _ => {}
        }

        self.fan_out(conn_id, &msg);
    }

    /// Full snapshot for late joiners
    pub fn sync_state(&self) -> GameSyncState {
        GameSyncState {
            host_id: self.host_id.clone(),
            players: self.players(),
            level: self.level,
            game_started: self.game_started,
            popped_balloons: self.popped_balloons.clone(),
            collected_gems: self.collected_gems.clone(),
        }
    }

    fn players(&self) -> Vec<PlayerInfo> {
        self.members.iter().map(|m| m.info.clone()).collect()
    }

    fn update_member(&mut self, conn_id: ConnectionId, f: impl FnOnce(&mut PlayerInfo)) {
        if let Some(member) = self.members.iter_mut().find(|m| m.conn_id == conn_id) {
            f(&mut member.info);
        }
    }

    fn broadcast_player_list(&self) {
        let list = Message::PlayerList {
            players: self.players(),
            host_id: self.host_id.clone(),
        };
        for member in &self.members {
            let _ = member.outbox.send(list.clone());
        }
    }

    /// Everyone but the sender
    fn fan_out(&self, from: ConnectionId, msg: &Message) {
        for member in self.members.iter().filter(|m| m.conn_id != from) {
            let _ = member.outbox.send(msg.clone());
        }
    }

    fn send_to(&self, conn_id: ConnectionId, msg: Message) {
        if let Some(member) = self.members.iter().find(|m| m.conn_id == conn_id) {
            let _ = member.outbox.send(msg);
        }
    }
}

/// Handle to a running room
#[derive(Clone, Debug)]
pub struct RoomHandle {
    pub id: Uuid,
    pub code: RoomCode,
    commands: mpsc::UnboundedSender<RoomCommand>,
    player_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    /// Queue a command; false once the room task is gone
    pub fn send(&self, cmd: RoomCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }

    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }
}

/// The room task: single writer of one room's state
pub struct Room {
    id: Uuid,
    state: RoomState,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    player_count: Arc<AtomicUsize>,
    registry: Arc<RoomRegistry>,
}

impl Room {
    pub fn new(code: RoomCode, max_players: usize, registry: Arc<RoomRegistry>) -> (Self, RoomHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let player_count = Arc::new(AtomicUsize::new(0));

        let handle = RoomHandle {
            id,
            code: code.clone(),
            commands: tx,
            player_count: player_count.clone(),
        };

        let room = Self {
            id,
            state: RoomState::new(code, max_players),
            commands: rx,
            player_count,
            registry,
        };

        (room, handle)
    }

    /// Process commands in arrival order until the last member leaves
    pub async fn run(mut self) {
        info!(room = %self.state.code(), "Room opened");

        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                RoomCommand::Join {
                    conn_id,
                    player,
                    outbox,
                    reply,
                } => {
                    let result = self.state.join(conn_id, player, outbox);
                    self.player_count.store(self.state.len(), Ordering::Relaxed);
                    let _ = reply.send(result);
                }
                RoomCommand::Relay { conn_id, msg } => self.state.handle(conn_id, msg),
                RoomCommand::Disconnect { conn_id } => {
                    self.state.leave(conn_id);
                }
            }

            self.player_count.store(self.state.len(), Ordering::Relaxed);
            if self.state.is_empty() {
                break;
            }
        }

        self.registry.remove(self.state.code(), self.id);
        self.commands.close();

        // Joins that raced the shutdown
        while let Ok(cmd) = self.commands.try_recv() {
            if let RoomCommand::Join { reply, .. } = cmd {
                let _ = reply.send(Err(JoinRejected {
                    code: ErrorCode::RoomNotFound,
                    message: format!("room {} was closed", self.state.code()),
                }));
            }
        }

        info!(room = %self.state.code(), "Room closed");
    }
}
