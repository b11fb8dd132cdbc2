//! In-memory connector for exercising clients without a relay

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::session::{Connector, Transport, TransportError};
use crate::ws::protocol::Message;

/// Hands out scripted connections in the order they were queued
#[derive(Clone, Default)]
pub struct ChannelConnector {
    pending: Arc<Mutex<VecDeque<Option<ChannelTransport>>>>,
    endpoints: Arc<Mutex<Vec<String>>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection that will succeed; the returned end plays the relay
    pub fn expect_connection(&self) -> RelayEnd {
        let (to_relay_tx, to_relay_rx) = mpsc::unbounded_channel();
        let (from_relay_tx, from_relay_rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().push_back(Some(ChannelTransport {
            to_relay: Some(to_relay_tx),
            from_relay: from_relay_rx,
        }));
        RelayEnd {
            inbox: to_relay_rx,
            outbox: from_relay_tx,
        }
    }

    /// Queue a connection attempt that fails
    pub fn refuse_connection(&self) {
        self.pending.lock().unwrap().push_back(None);
    }

    /// Endpoints passed to `connect`, in call order
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    async fn connect(&self, endpoint: &str) -> Result<ChannelTransport, TransportError> {
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        self.pending
            .lock()
            .unwrap()
            .pop_front()
            .flatten()
            .ok_or_else(|| TransportError::Other("connection refused".to_string()))
    }
}

pub struct ChannelTransport {
    to_relay: Option<mpsc::UnboundedSender<String>>,
    from_relay: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.to_relay
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(text)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_relay.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.to_relay = None;
        Ok(())
    }
}

/// Relay side of a scripted connection
pub struct RelayEnd {
    inbox: mpsc::UnboundedReceiver<String>,
    outbox: mpsc::UnboundedSender<String>,
}

impl RelayEnd {
    /// Next message the client sent, `None` once the client closed
    pub async fn next_message(&mut self) -> Option<Message> {
        let text = self.inbox.recv().await?;
        Some(serde_json::from_str(&text).expect("client sent valid json"))
    }

    /// Everything the client sent so far, without waiting
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(text) = self.inbox.try_recv() {
            out.push(serde_json::from_str(&text).expect("client sent valid json"));
        }
        out
    }

    pub fn push(&self, msg: &Message) {
        let text = serde_json::to_string(msg).expect("serializable");
        let _ = self.outbox.send(text);
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.outbox.send(text.to_string());
    }

    /// Drop the connection from the relay side
    pub fn hang_up(self) {}

    /// Resolve once the client side released the transport
    pub async fn wait_closed(&mut self) {
        while self.inbox.recv().await.is_some() {}
    }
}
