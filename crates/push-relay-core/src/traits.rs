//! Core types and collaborator traits.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{BackendConfig, SessionEvent};

/// Identifier scoping all persisted state to one user or account.
///
/// Always supplied by the caller, never generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionOwner(String);

impl SessionOwner {
    /// Wrap a caller-supplied owner id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionOwner {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionOwner {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Registration artifact obtained from the messaging backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Registration token handed to the presentation layer.
    pub token: String,
    /// Sender identity the registration was made for.
    pub sender_id: String,
    /// Adapter-private delivery data (key material, device ids).
    #[serde(default)]
    pub delivery: Map<String, Value>,
}

impl Credentials {
    #[must_use]
    pub fn new(token: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            sender_id: sender_id.into(),
            delivery: Map::new(),
        }
    }

    /// Attach adapter-private delivery data.
    #[must_use]
    pub fn with_delivery(mut self, delivery: Map<String, Value>) -> Self {
        self.delivery = delivery;
        self
    }
}

/// One notification pushed by an open listen handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// Notification payload, forwarded as-is.
    pub notification: Value,
    /// Backend identifier used as a checkpoint.
    pub delivery_id: String,
}

impl DeliveryEvent {
    #[must_use]
    pub fn new(delivery_id: impl Into<String>, notification: Value) -> Self {
        Self {
            notification,
            delivery_id: delivery_id.into(),
        }
    }
}

/// Session state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session and no start in flight.
    Idle,
    /// Registration or listen is in flight.
    Starting,
    /// A listen handle is open.
    Listening,
    /// A start attempt failed; always followed by `Idle`.
    Failed,
}

impl SessionPhase {
    /// Whether a start in this phase must be treated as a duplicate.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Listening)
    }
}

/// Key-value store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable key-value persistence facility.
///
/// Implementations serialize their own reads and writes per key. A `set`
/// either fully applies or not at all.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    /// Returns error if the backing medium cannot be read.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Overwrite a value.
    ///
    /// # Errors
    /// Returns error if the value could not be persisted.
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Registration failure reported by the messaging client.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    #[error("Invalid backend config: {0}")]
    InvalidConfig(String),
    #[error("Backend unreachable: {0}")]
    Unreachable(String),
    #[error("Backend rejected registration: {0}")]
    Rejected(String),
}

/// Listen failure reported by the messaging client.
#[derive(Debug, Clone, Error)]
pub enum ListenError {
    #[error("Failed to open delivery channel: {0}")]
    Connect(String),
    #[error("Credentials refused by backend: {0}")]
    InvalidCredentials(String),
}

/// Outbound transport error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Destination endpoint is unreachable")]
    Unreachable,
    #[error("Destination channel is closed")]
    Closed,
}

/// Receives delivery events from an open listen handle.
///
/// Called by a single producer, one event at a time, in arrival order.
pub trait DeliveryHandler: Send + Sync {
    fn on_delivery(&self, event: DeliveryEvent);
}

/// Live delivery channel. Must be explicitly destroyed.
pub trait ListenHandle: Send + Sync {
    /// Close the channel. No delivery may follow.
    fn destroy(self: Box<Self>);
}

/// Messaging backend client.
///
/// Timeouts are the client's concern; a timed-out operation reports an
/// error like any other failure.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Obtain fresh credentials for `config`.
    async fn register(&self, config: &BackendConfig) -> Result<Credentials, RegistrationError>;

    /// Open a delivery channel, skipping notifications in `checkpoints`.
    async fn listen(
        &self,
        credentials: &Credentials,
        checkpoints: &[String],
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn ListenHandle>, ListenError>;
}

/// Destination for outbound session events (one presentation context).
pub trait Endpoint: Send + Sync {
    /// Whether the context still exists.
    fn is_alive(&self) -> bool;

    /// Deliver an event.
    ///
    /// # Errors
    /// Returns `TransportError::Unreachable` if the context is gone, or
    /// `TransportError::Closed` if its channel no longer accepts events.
    fn send(&self, event: SessionEvent) -> Result<(), TransportError>;
}
