//! Real-time transport contract.
//!
//! The session only needs to emit [`ClientEvent`]s, observe connection
//! state, and receive [`ServerEvent`]s; inbound events are handed to the
//! session driver as an mpsc receiver when the transport is built.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use veilchat_shared::api::ws::{ClientEvent, ServerEvent};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    fn watch_connection(&self) -> watch::Receiver<ConnectionState>;

    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self);

    /// Fire-and-forget send. Fails with [`ClientError::Disconnected`] when
    /// not connected; completion is only observable through server events.
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError>;
}

/// In-process transport backed by channels. The [`ChannelPeer`] plays the
/// server side.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
}

/// Server end of a [`ChannelTransport`].
pub struct ChannelPeer {
    outbound: mpsc::UnboundedReceiver<ClientEvent>,
    inbound: mpsc::UnboundedSender<ServerEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
}

/// Build a disconnected channel transport, the receiver of server events to
/// hand to the session driver, and the server-side peer.
pub fn channel_transport() -> (
    ChannelTransport,
    mpsc::UnboundedReceiver<ServerEvent>,
    ChannelPeer,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    let state = Arc::new(state);
    (
        ChannelTransport {
            outbound: out_tx,
            state: state.clone(),
        },
        in_rx,
        ChannelPeer {
            outbound: out_rx,
            inbound: in_tx,
            state,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> Result<(), ClientError> {
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(ClientError::Disconnected);
        }
        self.outbound
            .send(event)
            .map_err(|_| ClientError::Disconnected)
    }
}

impl ChannelPeer {
    /// Deliver an event to the client.
    pub fn push(&self, event: ServerEvent) -> bool {
        self.inbound.send(event).is_ok()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Everything the client has emitted since the last call.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn next(&mut self) -> Option<ClientEvent> {
        self.outbound.recv().await
    }
}
