//! Room Lifecycle Manager - create/join/leave, roster and host tracking
//!
//! [`RoomClient`] is driven from the game loop. Network traffic is applied
//! when the loop calls [`RoomClient::poll`]; remote poses advance when it calls
//! [`RoomClient::advance_interpolation`]. Both run on the caller's thread, so the
//! roster, the pose store and the world-event sets each have exactly one writer.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::client::broadcaster::PositionBroadcaster;
use crate::client::events::WorldEventRelay;
use crate::client::remote::RemoteStateStore;
use crate::client::session::{
    ConnectionError, Connector, SessionError, SessionEvent, SessionState, TransportSession,
    WsConnector,
};
use crate::config::ClientConfig;
use crate::identity::{generate_player_id, generate_room_code, InvalidRoomCode, PlayerId, RoomCode};
use crate::ws::protocol::{ErrorCode, Message, PlayerInfo, Pose};

/// Room operation failures. `Display` is meant for players.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room could not be created: {0}")]
    Creation(#[source] ConnectionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    InvalidRoomCode(#[from] InvalidRoomCode),

    #[error("room {code} not found: {reason}")]
    NotFound { code: RoomCode, reason: String },

    #[error("room {code} is full: {reason}")]
    Full { code: RoomCode, reason: String },

    #[error("join rejected: {reason}")]
    Rejected { code: ErrorCode, reason: String },

    #[error("no answer from the relay within {0:?}")]
    JoinTimeout(Duration),

    #[error("relay connection lost: {}", .reason.as_deref().unwrap_or("closed by relay"))]
    Disconnected { reason: Option<String> },

    #[error("no free room code after {0} attempts")]
    CodeSpaceExhausted(u32),

    #[error("already in a room")]
    AlreadyInRoom,

    #[error("not in a room")]
    NotInRoom,

    #[error("only the host can start the game")]
    NotHost,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RoomError {
    fn from_relay(code: ErrorCode, room: &RoomCode, reason: String) -> Self {
        match code {
            ErrorCode::RoomNotFound => Self::NotFound {
                code: room.clone(),
                reason,
            },
            ErrorCode::RoomFull => Self::Full {
                code: room.clone(),
                reason,
            },
            code => Self::Rejected { code, reason },
        }
    }

    fn is_code_taken(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                code: ErrorCode::RoomCodeTaken,
                ..
            }
        )
    }
}

/// The player on this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlayer {
    pub player_id: PlayerId,
    pub name: String,
    pub character_variant: String,
    pub ready: bool,
}

/// Another participant as known from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlayer {
    pub player_id: PlayerId,
    pub name: String,
    pub character_variant: String,
    pub ready: bool,
    pub attacking: bool,
}

impl RemotePlayer {
    fn from_info(info: PlayerInfo, attacking: bool) -> Self {
        Self {
            player_id: info.player_id,
            name: info.name,
            character_variant: info.character_variant,
            ready: info.ready,
            attacking,
        }
    }
}

/// Client side of one room session
pub struct RoomClient<C: Connector = WsConnector> {
    connector: C,
    config: ClientConfig,
    session: TransportSession,
    local: Option<LocalPlayer>,
    room_code: Option<RoomCode>,
    host_id: Option<PlayerId>,
    roster: BTreeMap<PlayerId, RemotePlayer>,
    game_started: bool,
    remote: RemoteStateStore,
    world: WorldEventRelay,
    broadcaster: PositionBroadcaster,
}

impl RoomClient<WsConnector> {
    /// Client that talks WebSocket to `config.relay_url`
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(WsConnector, config)
    }
}

impl<C: Connector> RoomClient<C> {
    pub fn new(connector: C, config: ClientConfig) -> Self {
        Self {
            remote: RemoteStateStore::new(config.interpolation_factor),
            broadcaster: PositionBroadcaster::new(&config),
            world: WorldEventRelay::new(),
            connector,
            config,
            session: TransportSession::new(),
            local: None,
            room_code: None,
            host_id: None,
            roster: BTreeMap::new(),
            game_started: false,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a new room as host. Re-rolls the code if the relay reports a collision.
    pub async fn create_room(
        &mut self,
        name: &str,
        character_variant: &str,
    ) -> Result<RoomCode, RoomError> {
        self.ensure_idle()?;
        let local = LocalPlayer {
            player_id: generate_player_id(),
            name: name.to_string(),
            character_variant: character_variant.to_string(),
            ready: false,
        };

        let attempts = self.config.create_attempts.max(1);
        for attempt in 1..=attempts {
            let code = generate_room_code();
            let endpoint = self.endpoint(&code, true);
            if let Err(e) = self.session.connect(&self.connector, &endpoint).await {
                return Err(RoomError::Creation(e));
            }

            match self.handshake(&local, &code).await {
                Ok(()) => {
                    info!(room = %code, player_id = %local.player_id, "Created room");
                    return Ok(code);
                }
                Err(e) if e.is_code_taken() => {
                    debug!(room = %code, attempt, "Room code taken, re-rolling");
                    self.session.close();
                }
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }

        self.reset();
        Err(RoomError::CodeSpaceExhausted(attempts))
    }

    /// Join an existing room by its code
    pub async fn join_room(
        &mut self,
        code: &str,
        name: &str,
        character_variant: &str,
    ) -> Result<(), RoomError> {
        self.ensure_idle()?;
        let code = RoomCode::parse(code)?;
        let local = LocalPlayer {
            player_id: generate_player_id(),
            name: name.to_string(),
            character_variant: character_variant.to_string(),
            ready: false,
        };

        let endpoint = self.endpoint(&code, false);
        self.session.connect(&self.connector, &endpoint).await?;

        match self.handshake(&local, &code).await {
            Ok(()) => {
                info!(room = %code, player_id = %local.player_id, "Joined room");
                Ok(())
            }
            Err(e) => {
                warn!(room = %code, error = %e, "Join failed");
                self.reset();
                Err(e)
            }
        }
    }

    /// Leave the room. Local cleanup happens even if the relay never hears about it.
    pub fn leave_room(&mut self) {
        if let Some(local) = &self.local {
            let leave = Message::Leave {
                player_id: local.player_id.clone(),
            };
            if let Err(e) = self.session.send(leave) {
                debug!(error = %e, "Leave not sent");
            }
            info!(player_id = %local.player_id, "Left room");
        }
        self.reset();
    }

    /// Host only: tell everyone the game begins
    pub fn start_game(&mut self) -> Result<(), RoomError> {
        if self.local.is_none() {
            return Err(RoomError::NotInRoom);
        }
        if !self.is_host() {
            return Err(RoomError::NotHost);
        }
        self.session.send(Message::GameStart)?;
        self.game_started = true;
        Ok(())
    }

    pub fn set_ready(&mut self, ready: bool) -> Result<(), RoomError> {
        let local = self.local.as_mut().ok_or(RoomError::NotInRoom)?;
        local.ready = ready;
        let msg = Message::Ready {
            player_id: local.player_id.clone(),
            ready,
        };
        self.session.send(msg)?;
        Ok(())
    }

    pub fn set_character(&mut self, character_variant: &str) -> Result<(), RoomError> {
        let local = self.local.as_mut().ok_or(RoomError::NotInRoom)?;
        local.character_variant = character_variant.to_string();
        let msg = Message::CharacterUpdate {
            player_id: local.player_id.clone(),
            character_variant: character_variant.to_string(),
        };
        self.session.send(msg)?;
        Ok(())
    }

    /// Ask the relay for a full snapshot (after a suspected desync)
    pub fn request_sync(&mut self) -> Result<(), RoomError> {
        if self.local.is_none() {
            return Err(RoomError::NotInRoom);
        }
        self.session.send(Message::RequestSync)?;
        self.world.expect_sync();
        Ok(())
    }

    // ========================================================================
    // Per-frame driving
    // ========================================================================

    /// Apply every message that arrived since the last call. Returns how many
    /// session events were handled.
    pub fn poll(&mut self) -> usize {
        if self.local.is_none() {
            // Left over from an abandoned create/join; nothing here is ours
            self.session.close();
            return 0;
        }

        let mut handled = 0;
        while let Some(event) = self.session.try_recv() {
            handled += 1;
            match event {
                SessionEvent::Message(msg) => self.handle_message(msg),
                SessionEvent::Closed { reason } => {
                    warn!(reason = ?reason, "Relay connection lost, leaving room");
                    self.reset();
                    break;
                }
            }
        }
        handled
    }

    /// Sample the local pose; sends only what the broadcaster lets through
    pub fn broadcast_local(&mut self, pose: Pose, attacking: bool, now: Instant) {
        let Some(local) = &self.local else {
            return;
        };
        for msg in self.broadcaster.sample(&local.player_id, pose, attacking, now) {
            if let Err(e) = self.session.send(msg) {
                debug!(error = %e, "Pose not sent");
                // Resend edge and pose on the next sample
                self.broadcaster.reset();
                break;
            }
        }
    }

    /// Render tick: move remote poses toward their targets
    pub fn advance_interpolation(&mut self) {
        self.remote.advance();
    }

    /// Balloons destroyed by local physics
    pub fn report_balloons_popped(
        &mut self,
        balloon_ids: impl IntoIterator<Item = String>,
    ) -> Result<(), RoomError> {
        let local = self.local.as_ref().ok_or(RoomError::NotInRoom)?;
        if let Some(msg) = self.world.originate_balloon_pop(balloon_ids, &local.player_id) {
            self.session.send(msg)?;
        }
        Ok(())
    }

    pub fn report_gem_collected(&mut self, gem_id: impl Into<String>) -> Result<(), RoomError> {
        let local = self.local.as_ref().ok_or(RoomError::NotInRoom)?;
        if let Some(msg) = self
            .world
            .originate_gem_collect(gem_id.into(), &local.player_id)
        {
            self.session.send(msg)?;
        }
        Ok(())
    }

    pub fn change_level(&mut self, level: u32) -> Result<(), RoomError> {
        if self.local.is_none() {
            return Err(RoomError::NotInRoom);
        }
        if let Some(msg) = self.world.originate_level_change(level) {
            self.session.send(msg)?;
        }
        Ok(())
    }

    // ========================================================================
    // Read access
    // ========================================================================

    pub fn connection_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_in_room(&self) -> bool {
        self.local.is_some()
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.room_code.as_ref()
    }

    pub fn local_player(&self) -> Option<&LocalPlayer> {
        self.local.as_ref()
    }

    pub fn local_player_id(&self) -> Option<&PlayerId> {
        self.local.as_ref().map(|l| &l.player_id)
    }

    pub fn host_id(&self) -> Option<&PlayerId> {
        self.host_id.as_ref()
    }

    pub fn is_host(&self) -> bool {
        matches!((&self.local, &self.host_id), (Some(local), Some(host)) if &local.player_id == host)
    }

    pub fn game_started(&self) -> bool {
        self.game_started
    }

    pub fn level(&self) -> u32 {
        self.world.level()
    }

    /// Remote participants (the local player is not included)
    pub fn roster(&self) -> impl Iterator<Item = &RemotePlayer> {
        self.roster.values()
    }

    pub fn remote_player(&self, player_id: &PlayerId) -> Option<&RemotePlayer> {
        self.roster.get(player_id)
    }

    /// Every member of the room including the local player, sorted
    pub fn member_ids(&self) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self.roster.keys().cloned().collect();
        if let Some(local) = &self.local {
            ids.push(local.player_id.clone());
        }
        ids.sort();
        ids
    }

    /// Smoothed pose to render for a remote player
    pub fn remote_pose(&self, player_id: &PlayerId) -> Option<Pose> {
        self.remote.current(player_id)
    }

    pub fn remote_state(&self) -> &RemoteStateStore {
        &self.remote
    }

    pub fn world(&self) -> &WorldEventRelay {
        &self.world
    }

    /// For subscribing to relayed world events
    pub fn world_mut(&mut self) -> &mut WorldEventRelay {
        &mut self.world
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn endpoint(&self, code: &RoomCode, create: bool) -> String {
        format!(
            "{}/ws?room={}&create={}",
            self.config.relay_url.trim_end_matches('/'),
            code,
            create
        )
    }

    fn ensure_idle(&mut self) -> Result<(), RoomError> {
        if self.local.is_some() {
            return Err(RoomError::AlreadyInRoom);
        }
        // Leftover from an abandoned create/join
        self.session.close();
        Ok(())
    }

    /// Send `join` and wait for `player_list` or `error`
    async fn handshake(&mut self, local: &LocalPlayer, code: &RoomCode) -> Result<(), RoomError> {
        self.session.send(Message::Join {
            player_id: local.player_id.clone(),
            name: local.name.clone(),
            character_variant: local.character_variant.clone(),
        })?;

        let timeout = self.config.join_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.session.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(RoomError::Disconnected { reason: None }),
                Err(_) => return Err(RoomError::JoinTimeout(timeout)),
            };

            match event {
                SessionEvent::Message(Message::PlayerList { players, host_id }) => {
                    self.local = Some(local.clone());
                    self.room_code = Some(code.clone());
                    self.apply_player_list(players, host_id);
                    // The relay follows the roster with a snapshot
                    self.world.expect_sync();
                    return Ok(());
                }
                SessionEvent::Message(Message::Error {
                    code: error_code,
                    message,
                }) => {
                    return Err(RoomError::from_relay(error_code, code, message));
                }
                SessionEvent::Message(other) => {
                    debug!(kind = other.kind(), "Message before join acknowledgement, dropping");
                }
                SessionEvent::Closed { reason } => {
                    return Err(RoomError::Disconnected { reason });
                }
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::PlayerList { players, host_id } => {
                self.apply_player_list(players, host_id);
            }
            Message::SyncState { state } => {
                self.apply_player_list(state.players.clone(), state.host_id.clone());
                self.game_started = state.game_started;
                self.world.apply_sync(&state);
            }
            Message::Leave { player_id } => self.remove_player(&player_id),
            Message::Position {
                player_id,
                x,
                y,
                z,
                rotation,
            } => {
                self.remote
                    .set_target(&player_id, Pose::new(x, y, z, rotation));
            }
            Message::Attack { player_id } => self.set_attacking(&player_id, true),
            Message::AttackEnd { player_id } => self.set_attacking(&player_id, false),
            Message::CharacterUpdate {
                player_id,
                character_variant,
            } => {
                if let Some(player) = self.roster.get_mut(&player_id) {
                    player.character_variant = character_variant;
                }
            }
            Message::Ready { player_id, ready } => {
                if let Some(player) = self.roster.get_mut(&player_id) {
                    player.ready = ready;
                }
            }
            Message::GameStart => {
                info!("Game started");
                self.game_started = true;
            }
            msg @ (Message::BalloonPop { .. }
            | Message::GemCollect { .. }
            | Message::LevelChange { .. }) => {
                self.world.apply_inbound(&msg);
            }
            Message::Error { code, message } => {
                warn!(code = ?code, reason = %message, "Relay reported an error");
            }
            msg @ (Message::Join { .. } | Message::RequestSync) => {
                warn!(kind = msg.kind(), "Protocol violation, dropping message");
            }
        }
    }

    /// Replace the roster wholesale; the relay is the source of truth
    fn apply_player_list(&mut self, players: Vec<PlayerInfo>, host_id: Option<PlayerId>) {
        let local_id = self.local.as_ref().map(|l| l.player_id.clone());
        let mut next = BTreeMap::new();
        for info in players {
            if Some(&info.player_id) == local_id.as_ref() {
                continue;
            }
            let attacking = self
                .roster
                .get(&info.player_id)
                .map(|p| p.attacking)
                .unwrap_or(false);
            if !self.roster.contains_key(&info.player_id) {
                info!(player_id = %info.player_id, name = %info.name, "Player joined");
            }
            next.insert(info.player_id.clone(), RemotePlayer::from_info(info, attacking));
        }
        for gone in self.roster.keys().filter(|id| !next.contains_key(*id)) {
            info!(player_id = %gone, "Player left");
        }

        self.roster = next;
        self.host_id = host_id;

        let ids: HashSet<PlayerId> = self.roster.keys().cloned().collect();
        self.remote.retain(&ids);
    }

    fn remove_player(&mut self, player_id: &PlayerId) {
        if self.roster.remove(player_id).is_some() {
            info!(player_id = %player_id, "Player left");
        }
        self.remote.remove(player_id);
    }

    fn set_attacking(&mut self, player_id: &PlayerId, attacking: bool) {
        if let Some(player) = self.roster.get_mut(player_id) {
            player.attacking = attacking;
        }
    }

    /// Drop everything tied to the current room
    fn reset(&mut self) {
        self.session.close();
        self.local = None;
        self.room_code = None;
        self.host_id = None;
        self.roster.clear();
        self.game_started = false;
        self.remote.clear();
        self.world.clear();
        self.broadcaster.reset();
    }
}

impl<C: Connector> std::fmt::Debug for RoomClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("state", &self.session.state())
            .field("room_code", &self.room_code)
            .field("local", &self.local)
            .field("host_id", &self.host_id)
            .field("roster", &self.roster.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::events::{WorldEvent, WorldEventKind};
    use crate::client::testing::{ChannelConnector, RelayEnd};
    use crate::ws::protocol::GameSyncState;
    use std::sync::{Arc, Mutex};

    fn config() -> ClientConfig {
        ClientConfig {
            join_timeout: Duration::from_secs(2),
            ..ClientConfig::new("ws://relay.test")
        }
    }

    fn info(id: &PlayerId, name: &str) -> PlayerInfo {
        PlayerInfo {
            player_id: id.clone(),
            name: name.to_string(),
            character_variant: "fox".to_string(),
            ready: false,
        }
    }

    /// Answer the client's `join` the way the relay does: roster containing it
    /// and `others`, then a snapshot
    async fn accept_join(relay: &mut RelayEnd, others: &[PlayerInfo], host: Option<PlayerId>) -> PlayerId {
        let Some(Message::Join { player_id, name, .. }) = relay.next_message().await else {
            panic!("expected join");
        };
        let mut players = others.to_vec();
        players.push(PlayerInfo {
            player_id: player_id.clone(),
            name,
            character_variant: "fox".to_string(),
            ready: false,
        });
        let host_id = Some(host.unwrap_or_else(|| player_id.clone()));
        relay.push(&Message::PlayerList {
            players: players.clone(),
            host_id: host_id.clone(),
        });
        relay.push(&Message::SyncState {
            state: GameSyncState {
                host_id,
                players,
                ..GameSyncState::default()
            },
        });
        player_id
    }

    /// Joined client with one remote player `c2`, hosted by `c2`
    async fn joined_client() -> (RoomClient<ChannelConnector>, RelayEnd, PlayerId) {
        let connector = ChannelConnector::new();
        let mut relay = connector.expect_connection();
        let mut client = RoomClient::new(connector, config());
        let c2 = PlayerId::from("c2");

        let others = [info(&c2, "Bea")];
        let (joined, _) = tokio::join!(
            client.join_room("k7m2", "Ann", "fox"),
            accept_join(&mut relay, &others, Some(c2.clone()))
        );
        joined.unwrap();
        (client, relay, c2)
    }

    /// Next `n` messages the client sent
    async fn sent(relay: &mut RelayEnd, n: usize) -> Vec<Message> {
        let mut out = Vec::new();
        for _ in 0..n {
            let msg = tokio::time::timeout(Duration::from_secs(1), relay.next_message())
                .await
                .expect("message in time")
                .expect("connection open");
            out.push(msg);
        }
        out
    }

    async fn settle(client: &mut RoomClient<ChannelConnector>) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        client.poll();
    }

    #[tokio::test]
    async fn create_room_becomes_host() {
        let connector = ChannelConnector::new();
        let mut relay = connector.expect_connection();
        let mut client = RoomClient::new(connector.clone(), config());

        let (created, me) = tokio::join!(
            client.create_room("Ann", "fox"),
            accept_join(&mut relay, &[], None)
        );
        let code = created.unwrap();

        assert!(client.is_host());
        assert_eq!(client.local_player_id(), Some(&me));
        assert_eq!(client.room_code(), Some(&code));
        assert_eq!(client.connection_state(), SessionState::Connected);
        assert_eq!(
            connector.endpoints(),
            vec![format!("ws://relay.test/ws?room={code}&create=true")]
        );
    }

    #[tokio::test]
    async fn create_room_rerolls_taken_codes() {
        let connector = ChannelConnector::new();
        let mut first = connector.expect_connection();
        let mut second = connector.expect_connection();
        let mut client = RoomClient::new(connector.clone(), config());

        let relay = async {
            assert!(matches!(first.next_message().await, Some(Message::Join { .. })));
            first.push(&Message::error(ErrorCode::RoomCodeTaken, "code in use"));
            accept_join(&mut second, &[], None).await
        };
        let (created, _) = tokio::join!(client.create_room("Ann", "fox"), relay);

        assert!(created.is_ok());
        assert_eq!(connector.endpoints().len(), 2);
    }

    #[tokio::test]
    async fn create_room_fails_when_relay_unreachable() {
        let connector = ChannelConnector::new();
        connector.refuse_connection();
        let mut client = RoomClient::new(connector, config());

        let err = client.create_room("Ann", "fox").await.unwrap_err();
        assert!(matches!(err, RoomError::Creation(_)));
        assert_eq!(client.connection_state(), SessionState::Disconnected);
        assert!(!client.is_in_room());
    }

    #[tokio::test]
    async fn join_rejections_leave_no_roster() {
        for (code, expect_full) in [(ErrorCode::RoomNotFound, false), (ErrorCode::RoomFull, true)] {
            let connector = ChannelConnector::new();
            let mut relay = connector.expect_connection();
            let mut client = RoomClient::new(connector, config());

            let script = async {
                relay.next_message().await;
                relay.push(&Message::error(code, "nope"));
            };
            let (joined, _) = tokio::join!(client.join_room("K7M2", "Ann", "fox"), script);

            let err = joined.unwrap_err();
            if expect_full {
                assert!(matches!(err, RoomError::Full { .. }), "{err}");
            } else {
                assert!(matches!(err, RoomError::NotFound { .. }), "{err}");
            }
            assert!(err.to_string().contains("nope"));
            assert!(!client.is_in_room());
            assert_eq!(client.roster().count(), 0);
            assert_eq!(client.connection_state(), SessionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn join_rejects_malformed_code_without_connecting() {
        let connector = ChannelConnector::new();
        let mut client = RoomClient::new(connector.clone(), config());

        let err = client.join_room("K0", "Ann", "fox").await.unwrap_err();
        assert!(matches!(err, RoomError::InvalidRoomCode(_)));
        assert!(connector.endpoints().is_empty());
    }

    #[tokio::test]
    async fn join_times_out_without_answer() {
        let connector = ChannelConnector::new();
        let _relay = connector.expect_connection();
        let config = ClientConfig {
            join_timeout: Duration::from_millis(50),
            ..config()
        };
        let mut client = RoomClient::new(connector, config);

        let err = client.join_room("K7M2", "Ann", "fox").await.unwrap_err();
        assert!(matches!(err, RoomError::JoinTimeout(_)));
        assert!(!client.is_in_room());
    }

    #[tokio::test]
    async fn joined_roster_excludes_local_player() {
        let (client, _relay, c2) = joined_client().await;

        assert!(!client.is_host());
        assert_eq!(client.host_id(), Some(&c2));
        let roster: Vec<_> = client.roster().map(|p| p.player_id.clone()).collect();
        assert_eq!(roster, vec![c2.clone()]);
        assert_eq!(client.member_ids().len(), 2);
        assert!(client.remote_state().contains(&c2));
    }

    #[tokio::test]
    async fn second_join_is_rejected_locally() {
        let (mut client, _relay, _) = joined_client().await;
        let err = client.join_room("ABCD", "Ann", "fox").await.unwrap_err();
        assert!(matches!(err, RoomError::AlreadyInRoom));
        assert!(client.is_in_room());
    }

    #[tokio::test]
    async fn position_sets_target_and_ticks_converge() {
        let (mut client, relay, c2) = joined_client().await;

        relay.push(&Message::position(c2.clone(), Pose::new(0.0, 0.0, 0.0, 0.0)));
        relay.push(&Message::position(c2.clone(), Pose::new(5.0, 0.0, 3.0, 1.57)));
        settle(&mut client).await;

        let target = Pose::new(5.0, 0.0, 3.0, 1.57);
        assert_eq!(client.remote_state().target(&c2), Some(target));

        for _ in 0..100 {
            client.advance_interpolation();
        }
        let current = client.remote_pose(&c2).unwrap();
        assert!(current.distance(&target) < 1e-3);
        assert!((current.rotation - 1.57).abs() < 1e-3);
    }

    #[tokio::test]
    async fn peer_leave_drops_roster_and_pose_state() {
        let (mut client, relay, c2) = joined_client().await;
        relay.push(&Message::position(c2.clone(), Pose::default()));
        relay.push(&Message::Leave {
            player_id: c2.clone(),
        });
        settle(&mut client).await;

        assert!(client.remote_player(&c2).is_none());
        assert!(!client.remote_state().contains(&c2));
    }

    #[tokio::test]
    async fn player_list_replaces_roster() {
        let (mut client, relay, c2) = joined_client().await;
        let me = client.local_player_id().cloned().unwrap();
        let c3 = PlayerId::from("c3");

        relay.push(&Message::PlayerList {
            players: vec![info(&me, "Ann"), info(&c3, "Cy")],
            host_id: Some(c2.clone()),
        });
        settle(&mut client).await;

        assert!(client.remote_player(&c2).is_none());
        assert!(client.remote_player(&c3).is_some());
        assert!(client.remote_state().contains(&c3));
        assert!(!client.remote_state().contains(&c2));
    }

    #[tokio::test]
    async fn attack_edges_update_roster() {
        let (mut client, relay, c2) = joined_client().await;
        relay.push(&Message::Attack {
            player_id: c2.clone(),
        });
        settle(&mut client).await;
        assert!(client.remote_player(&c2).unwrap().attacking);

        relay.push(&Message::AttackEnd {
            player_id: c2.clone(),
        });
        settle(&mut client).await;
        assert!(!client.remote_player(&c2).unwrap().attacking);
    }

    #[tokio::test]
    async fn non_host_cannot_start_game() {
        let (mut client, mut relay, _) = joined_client().await;
        assert!(matches!(client.start_game(), Err(RoomError::NotHost)));
        assert!(!client.game_started());

        settle(&mut client).await;
        assert!(relay.drain().is_empty());
    }

    #[tokio::test]
    async fn relay_disconnect_tears_room_down() {
        let (mut client, relay, c2) = joined_client().await;
        relay.hang_up();
        settle(&mut client).await;

        assert!(!client.is_in_room());
        assert!(client.remote_player(&c2).is_none());
        assert_eq!(client.connection_state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn leave_room_sends_leave_and_clears_state() {
        let (mut client, mut relay, c2) = joined_client().await;
        let me = client.local_player_id().cloned().unwrap();
        client
            .report_balloons_popped(vec!["b1".to_string()])
            .unwrap();

        client.leave_room();
        client.leave_room();

        assert!(!client.is_in_room());
        assert!(client.remote_player(&c2).is_none());
        assert!(client.world().popped_balloons().is_empty());

        let mut sent = Vec::new();
        while let Some(msg) = relay.next_message().await {
            sent.push(msg);
        }
        assert_eq!(sent.last(), Some(&Message::Leave { player_id: me }));
    }

    #[tokio::test]
    async fn sync_state_catches_up_late_joiner() {
        let (mut client, relay, c2) = joined_client().await;
        let gems = Arc::new(Mutex::new(Vec::new()));
        let sink = gems.clone();
        client
            .world_mut()
            .subscribe(WorldEventKind::GemCollect, move |e| sink.lock().unwrap().push(e.clone()));

        let state = GameSyncState {
            host_id: Some(c2.clone()),
            players: vec![info(&c2, "Bea")],
            game_started: true,
            collected_gems: ["gem_9".to_string()].into_iter().collect(),
            ..GameSyncState::default()
        };
        relay.push(&Message::SyncState { state });
        settle(&mut client).await;

        assert!(client.world().is_gem_collected("gem_9"));
        assert!(client.game_started());
        assert_eq!(
            gems.lock().unwrap().as_slice(),
            &[WorldEvent::GemCollect {
                gem_id: "gem_9".into()
            }]
        );
    }

    #[tokio::test]
    async fn local_world_events_are_sent_once() {
        let (mut client, mut relay, _) = joined_client().await;
        client
            .report_balloons_popped(vec!["b1".to_string(), "b2".to_string()])
            .unwrap();
        client.report_balloons_popped(vec!["b1".to_string()]).unwrap();
        client.report_gem_collected("gem_1").unwrap();
        client.change_level(3).unwrap();

        let kinds: Vec<&'static str> = sent(&mut relay, 3).await.iter().map(Message::kind).collect();
        assert_eq!(kinds, vec!["balloon_pop", "gem_collect", "level_change"]);
        assert_eq!(client.level(), 3);
    }

    #[tokio::test]
    async fn inbound_world_events_are_not_echoed() {
        let (mut client, mut relay, c2) = joined_client().await;
        relay.push(&Message::BalloonPop {
            balloon_ids: vec!["b7".into()],
            popped_by: c2,
        });
        settle(&mut client).await;

        assert!(client.world().is_balloon_popped("b7"));
        assert!(relay.drain().is_empty());
    }

    #[tokio::test]
    async fn broadcast_local_is_throttled() {
        let (mut client, mut relay, _) = joined_client().await;
        let start = Instant::now();
        for frame in 0..6u64 {
            let now = start + Duration::from_millis(frame * 16);
            client.broadcast_local(Pose::new(frame as f32, 0.0, 0.0, 0.0), frame >= 2, now);
        }

        let kinds: Vec<&'static str> = sent(&mut relay, 3).await.iter().map(Message::kind).collect();
        assert_eq!(kinds, vec!["position", "attack", "position"]);
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_undo_level_change() {
        let (mut client, mut relay, c2) = joined_client().await;
        settle(&mut client).await;

        client.request_sync().unwrap();
        client.change_level(2).unwrap();
        client
            .report_balloons_popped(vec!["b1".to_string()])
            .unwrap();

        // Built before the relay saw the level change
        relay.push(&Message::SyncState {
            state: GameSyncState {
                host_id: Some(c2.clone()),
                players: vec![info(&c2, "Bea")],
                level: 0,
                ..GameSyncState::default()
            },
        });
        settle(&mut client).await;

        assert_eq!(client.level(), 2);
        assert!(client.world().is_balloon_popped("b1"));
        let kinds: Vec<&'static str> = sent(&mut relay, 3).await.iter().map(Message::kind).collect();
        assert_eq!(kinds, vec!["request_sync", "level_change", "balloon_pop"]);
    }

    #[tokio::test]
    async fn reply_to_abandoned_join_is_discarded() {
        let connector = ChannelConnector::new();
        let mut relay = connector.expect_connection();
        let mut client = RoomClient::new(connector, config());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            client.join_room("K7M2", "Ann", "fox"),
        )
        .await;
        assert!(abandoned.is_err());

        let c2 = PlayerId::from("c2");
        accept_join(&mut relay, &[info(&c2, "Bea")], Some(c2.clone())).await;
        settle(&mut client).await;

        assert!(!client.is_in_room());
        assert_eq!(client.roster().count(), 0);
        assert!(client.host_id().is_none());
        assert!(client.remote_state().is_empty());
        assert_eq!(client.connection_state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_send_rearms_broadcaster() {
        let (mut client, relay, _) = joined_client().await;
        relay.hang_up();
        // Let the I/O task notice, but do not poll
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        client.broadcast_local(Pose::default(), true, Instant::now());
        assert!(!client.broadcaster.is_attacking());
    }
}
