//! In-process channel bridge for embedding the relay.

use std::sync::Arc;

use push_relay_core::{
    BackendConfig, Endpoint, SessionEvent, SessionOwner, traits::TransportError,
};
use tokio::sync::mpsc;

use crate::protocol::{InboundCommand, OutboundEvent};

/// Presentation side of the bridge.
pub struct ChannelBridge {
    /// Sender for commands.
    pub command_tx: mpsc::UnboundedSender<InboundCommand>,
    /// Receiver for events.
    pub event_rx: mpsc::UnboundedReceiver<OutboundEvent>,
}

impl ChannelBridge {
    /// Create a new bridge.
    ///
    /// Returns the bridge and the host side of the channel pair.
    #[must_use]
    pub fn new() -> (Self, BridgeSession) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let bridge = Self {
            command_tx,
            event_rx,
        };

        let session = BridgeSession {
            command_rx,
            endpoint: Arc::new(ChannelEndpoint::new(event_tx)),
        };

        (bridge, session)
    }

    /// Ask the host to start the notification service.
    ///
    /// # Errors
    /// Returns error if the host side is gone.
    pub fn start_service(
        &self,
        backend_config: BackendConfig,
        owner: impl Into<SessionOwner>,
    ) -> Result<(), SendError> {
        self.send(InboundCommand::start(backend_config, owner))
    }

    /// Ask the host to stop the notification service.
    ///
    /// # Errors
    /// Returns error if the host side is gone.
    pub fn stop_service(&self) -> Result<(), SendError> {
        self.send(InboundCommand::StopService)
    }

    /// Ask the host to tear the service down and drop this bridge.
    ///
    /// # Errors
    /// Returns error if the host side is gone.
    pub fn destroy_service(&self) -> Result<(), SendError> {
        self.send(InboundCommand::DestroyService)
    }

    fn send(&self, command: InboundCommand) -> Result<(), SendError> {
        self.command_tx
            .send(command)
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Receive an event (non-blocking).
    pub fn try_recv(&mut self) -> Option<OutboundEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<OutboundEvent> {
        self.event_rx.recv().await
    }
}

/// Host side of the bridge.
pub struct BridgeSession {
    /// Receiver for commands.
    pub command_rx: mpsc::UnboundedReceiver<InboundCommand>,
    /// Endpoint delivering events back to the bridge.
    pub endpoint: Arc<ChannelEndpoint>,
}

impl BridgeSession {
    /// Receive a command.
    pub async fn recv(&mut self) -> Option<InboundCommand> {
        self.command_rx.recv().await
    }
}

/// Endpoint backed by an unbounded channel.
///
/// Alive until the receiving half is dropped.
#[derive(Clone)]
pub struct ChannelEndpoint {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelEndpoint {
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self { tx }
    }
}

impl Endpoint for ChannelEndpoint {
    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, event: SessionEvent) -> Result<(), TransportError> {
        self.tx
            .send(event.into())
            .map_err(|_| TransportError::Closed)
    }
}

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Channel closed")]
    ChannelClosed,
}
