//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::identity::{PlayerId, RoomCode};
use crate::relay::{ConnectionId, RoomCommand, RoomHandle};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ErrorCode, Message, PlayerInfo};

type WsSink = SplitSink<WebSocket, WsMessage>;
type WsStream = SplitStream<WebSocket>;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Room code to join or create
    pub room: String,
    /// Open a new room under `room` instead of joining one
    #[serde(default)]
    pub create: bool,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, query: WsQuery, state: AppState) {
    let conn_id = Uuid::new_v4();
    debug!(conn_id = %conn_id, room = %query.room, create = query.create, "New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    let code = match RoomCode::parse(&query.room) {
        Ok(code) => code,
        Err(e) => {
            reject(&mut ws_sink, ErrorCode::InvalidRoomCode, e.to_string()).await;
            return;
        }
    };

    // The first message must be `join`
    let player = match tokio::time::timeout(
        state.config.join_timeout,
        next_message(&mut ws_stream),
    )
    .await
    {
        Ok(Some(Message::Join {
            player_id,
            name,
            character_variant,
        })) => PlayerInfo {
            player_id,
            name,
            character_variant,
            ready: false,
        },
        Ok(Some(other)) => {
            warn!(conn_id = %conn_id, kind = other.kind(), "Expected join");
            reject(&mut ws_sink, ErrorCode::JoinRequired, "first message must be join").await;
            return;
        }
        Ok(None) => {
            debug!(conn_id = %conn_id, "Closed before joining");
            return;
        }
        Err(_) => {
            reject(&mut ws_sink, ErrorCode::JoinTimeout, "no join received in time").await;
            return;
        }
    };

    let handle = if query.create {
        match state
            .rooms
            .create(code.clone(), state.config.max_room_players)
        {
            Ok(handle) => handle,
            Err(e) => {
                reject(&mut ws_sink, ErrorCode::RoomCodeTaken, e.to_string()).await;
                return;
            }
        }
    } else {
        match state.rooms.get(&code) {
            Some(handle) => handle,
            None => {
                reject(
                    &mut ws_sink,
                    ErrorCode::RoomNotFound,
                    format!("room {code} does not exist"),
                )
                .await;
                return;
            }
        }
    };

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    let player_id = player.player_id.clone();
    let sent = handle.send(RoomCommand::Join {
        conn_id,
        player,
        outbox: outbox_tx,
        reply: reply_tx,
    });

    let joined = match reply_rx.await {
        Ok(result) if sent => result,
        _ => {
            reject(
                &mut ws_sink,
                ErrorCode::RoomNotFound,
                format!("room {code} was closed"),
            )
            .await;
            return;
        }
    };
    if let Err(rejected) = joined {
        info!(room = %code, player_id = %player_id, code = ?rejected.code, "Join rejected");
        reject(&mut ws_sink, rejected.code, rejected.message).await;
        return;
    }

    let rate_limiter = ConnectionRateLimiter::new(state.config.input_rate_limit);
    run_session(conn_id, &player_id, handle, ws_sink, ws_stream, outbox_rx, rate_limiter).await;

    info!(room = %code, player_id = %player_id, "WebSocket connection closed");
}

/// Pump room traffic to the socket and socket traffic to the room
async fn run_session(
    conn_id: ConnectionId,
    player_id: &PlayerId,
    room: RoomHandle,
    mut ws_sink: WsSink,
    mut ws_stream: WsStream,
    mut outbox_rx: mpsc::UnboundedReceiver<Message>,
    rate_limiter: ConnectionRateLimiter,
) {
    // Spawn writer task: room outbox -> WebSocket
    let writer_player = player_id.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(player_id = %writer_player, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Reader loop: WebSocket -> room task
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(WsMessage::Text(text)) => {
                if !rate_limiter.check_inbound() {
                    warn!(player_id = %player_id, "Rate limited inbound message");
                    continue;
                }

                match serde_json::from_str::<Message>(&text) {
                    Ok(msg) => {
                        if !room.send(RoomCommand::Relay { conn_id, msg }) {
                            debug!(player_id = %player_id, "Room closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(player_id = %player_id, error = %e, "Protocol violation, dropping frame");
                    }
                }
            }
            Ok(WsMessage::Binary(_)) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(_)) => {
                debug!(player_id = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Signal disconnect to the room; harmless after an explicit leave
    room.send(RoomCommand::Disconnect { conn_id });

    writer_handle.abort();
}

/// First decodable protocol message, `None` if the socket closes first
async fn next_message(stream: &mut WsStream) -> Option<Message> {
    while let Some(result) = stream.next().await {
        match result {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Message>(&text) {
                Ok(msg) => return Some(msg),
                Err(e) => warn!(error = %e, "Protocol violation, dropping frame"),
            },
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Tell the client why and hang up
async fn reject(sink: &mut WsSink, code: ErrorCode, message: impl Into<String>) {
    let msg = Message::error(code, message);
    if let Err(e) = send_msg(sink, &msg).await {
        debug!(error = %e, "Failed to send rejection");
    }
    let _ = sink.close().await;
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut WsSink, msg: &Message) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(WsMessage::Text(json))
        .await
        .map_err(|e| e.to_string())
}
