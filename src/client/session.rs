//! Transport Session - one logical connection to a relay
//!
//! The session owns a background I/O task that talks to the [`Transport`].
//! The game loop talks to the session only through channels: `send` queues a
//! message without blocking, `try_recv` drains what arrived since the last
//! render tick. Nothing is retried automatically; a failed `connect` leaves the
//! session `Disconnected` and the caller decides what to do.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::ws::protocol::Message;

/// Upper bound on a graceful transport close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Failures of the underlying transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// The relay could not be reached
#[derive(Debug, thiserror::Error)]
#[error("cannot connect to relay at {endpoint}: {source}")]
pub struct ConnectionError {
    pub endpoint: String,
    #[source]
    pub source: TransportError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
}

/// A connected, text-framed, bidirectional channel to the relay
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame; `None` once the peer closed the connection
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn connect(&self, endpoint: &str) -> Result<Self::Transport, TransportError>;
}

/// WebSocket connector used against a real relay
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, endpoint: &str) -> Result<WsTransport, TransportError> {
        let (stream, _response) = connect_async(endpoint).await?;
        Ok(WsTransport { stream })
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(_)) => return None,
                Ok(WsMessage::Binary(_)) => {
                    warn!("Received binary frame, ignoring");
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the I/O task hands to the session owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(Message),
    /// Terminal; nothing follows
    Closed { reason: Option<String> },
}

pub struct TransportSession {
    state: SessionState,
    cmd_tx: Option<mpsc::UnboundedSender<Message>>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TransportSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            cmd_tx: None,
            events_rx: None,
            shutdown_tx: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Open a connection. Any previous connection is closed first.
    pub async fn connect<C: Connector>(
        &mut self,
        connector: &C,
        endpoint: &str,
    ) -> Result<(), ConnectionError> {
        self.close();
        self.state = SessionState::Connecting;
        debug!(endpoint, "Connecting to relay");

        let transport = match connector.connect(endpoint).await {
            Ok(transport) => transport,
            Err(source) => {
                self.state = SessionState::Disconnected;
                warn!(endpoint, error = %source, "Relay connection failed");
                return Err(ConnectionError {
                    endpoint: endpoint.to_string(),
                    source,
                });
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(io_loop(transport, cmd_rx, events_tx, shutdown_rx));

        self.cmd_tx = Some(cmd_tx);
        self.events_rx = Some(events_rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.state = SessionState::Connected;
        info!(endpoint, "Connected to relay");
        Ok(())
    }

    /// Queue a message. Fire-and-forget: delivery is not guaranteed.
    pub fn send(&self, msg: Message) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.cmd_tx
            .as_ref()
            .ok_or(SessionError::NotConnected)?
            .send(msg)
            .map_err(|_| SessionError::NotConnected)
    }

    /// Next pending event without waiting
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        let event = self.events_rx.as_mut()?.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    /// Wait for the next event. `None` when the session is not open.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let event = self.events_rx.as_mut()?.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Release the connection. Idempotent, never blocks.
    pub fn close(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
            debug!("Session closed");
        }
        self.cmd_tx = None;
        // Anything still queued belongs to the old connection
        self.events_rx = None;
        self.state = SessionState::Disconnected;
    }

    fn observe(&mut self, event: &SessionEvent) {
        if matches!(event, SessionEvent::Closed { .. }) {
            self.shutdown_tx = None;
            self.cmd_tx = None;
            self.state = SessionState::Disconnected;
        }
    }
}

impl Default for TransportSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state)
            .finish()
    }
}

/// Background loop multiplexing outbound commands, inbound frames and shutdown
async fn io_loop<T: Transport>(
    mut transport: T,
    mut cmd_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(msg) = cmd else {
                    close_transport(&mut transport).await;
                    break;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, kind = msg.kind(), "Failed to serialize message");
                        continue;
                    }
                };
                if let Err(e) = transport.send(text).await {
                    warn!(error = %e, "Transport send failed");
                    let _ = events_tx.send(SessionEvent::Closed {
                        reason: Some(format!("send failed: {e}")),
                    });
                    break;
                }
            }

            _ = &mut shutdown_rx => {
                // A `leave` queued right before close must still go out
                while let Ok(msg) = cmd_rx.try_recv() {
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if transport.send(text).await.is_err() {
                        break;
                    }
                }
                close_transport(&mut transport).await;
                break;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<Message>(&text) {
                        Ok(msg) => {
                            if events_tx.send(SessionEvent::Message(msg)).is_err() {
                                // Owner went away
                                close_transport(&mut transport).await;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Protocol violation, dropping frame");
                        }
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Transport receive failed");
                        let _ = events_tx.send(SessionEvent::Closed {
                            reason: Some(e.to_string()),
                        });
                        break;
                    }
                    None => {
                        info!("Relay closed the connection");
                        let _ = events_tx.send(SessionEvent::Closed { reason: None });
                        break;
                    }
                }
            }
        }
    }
}

async fn close_transport<T: Transport>(transport: &mut T) {
    match tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Transport close failed"),
        Err(_) => debug!("Transport close timed out"),
    }
}
