//! Wire protocol between the host process and presentation contexts.
//!
//! Every frame is a named message: `{"channel": <name>, "payload": <data>}`.

use push_relay_core::{BackendConfig, SessionEvent, SessionOwner};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const START_NOTIFICATION_SERVICE: &str = "PUSH_RECEIVER:::START_NOTIFICATION_SERVICE";
pub const NOTIFICATION_SERVICE_STARTED: &str = "PUSH_RECEIVER:::NOTIFICATION_SERVICE_STARTED";
pub const NOTIFICATION_SERVICE_ERROR: &str = "PUSH_RECEIVER:::NOTIFICATION_SERVICE_ERROR";
pub const STOP_NOTIFICATION_SERVICE: &str = "PUSH_RECEIVER:::STOP_NOTIFICATION_SERVICE";
pub const DESTROY_NOTIFICATION_SERVICE: &str = "PUSH_RECEIVER:::DESTROY_NOTIFICATION_SERVICE";
pub const NOTIFICATION_RECEIVED: &str = "PUSH_RECEIVER:::NOTIFICATION_RECEIVED";
pub const TOKEN_UPDATED: &str = "PUSH_RECEIVER:::TOKEN_UPDATED";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Payload of a start command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    #[serde(rename = "backendConfig", alias = "firebaseConfig")]
    pub backend_config: BackendConfig,
    #[serde(alias = "user")]
    pub owner: SessionOwner,
}

/// Command from a presentation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload")]
pub enum InboundCommand {
    /// Start (or re-announce) the notification service.
    #[serde(rename = "PUSH_RECEIVER:::START_NOTIFICATION_SERVICE")]
    StartService(StartPayload),
    /// Stop listening.
    #[serde(rename = "PUSH_RECEIVER:::STOP_NOTIFICATION_SERVICE")]
    StopService,
    /// Stop listening and close the sending context's connection.
    #[serde(rename = "PUSH_RECEIVER:::DESTROY_NOTIFICATION_SERVICE")]
    DestroyService,
}

impl InboundCommand {
    /// Build a start command.
    #[must_use]
    pub fn start(backend_config: BackendConfig, owner: impl Into<SessionOwner>) -> Self {
        Self::StartService(StartPayload {
            backend_config,
            owner: owner.into(),
        })
    }

    /// Channel name of this command.
    #[must_use]
    pub const fn channel(&self) -> &'static str {
        match self {
            Self::StartService(_) => START_NOTIFICATION_SERVICE,
            Self::StopService => STOP_NOTIFICATION_SERVICE,
            Self::DestroyService => DESTROY_NOTIFICATION_SERVICE,
        }
    }

    /// Decode a JSON frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a known command.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    /// Encode as a JSON frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Event sent to a presentation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload")]
pub enum OutboundEvent {
    /// Listening; carries the registration token.
    #[serde(rename = "PUSH_RECEIVER:::NOTIFICATION_SERVICE_STARTED")]
    ServiceStarted(String),
    /// Start failed; carries the error description.
    #[serde(rename = "PUSH_RECEIVER:::NOTIFICATION_SERVICE_ERROR")]
    ServiceError(String),
    /// Relayed notification payload.
    #[serde(rename = "PUSH_RECEIVER:::NOTIFICATION_RECEIVED")]
    NotificationReceived(Value),
    /// New registration token.
    #[serde(rename = "PUSH_RECEIVER:::TOKEN_UPDATED")]
    TokenUpdated(String),
}

impl OutboundEvent {
    /// Channel name of this event.
    #[must_use]
    pub const fn channel(&self) -> &'static str {
        match self {
            Self::ServiceStarted(_) => NOTIFICATION_SERVICE_STARTED,
            Self::ServiceError(_) => NOTIFICATION_SERVICE_ERROR,
            Self::NotificationReceived(_) => NOTIFICATION_RECEIVED,
            Self::TokenUpdated(_) => TOKEN_UPDATED,
        }
    }

    /// Decode a JSON frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a known event.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    /// Encode as a JSON frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

impl From<SessionEvent> for OutboundEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::ServiceStarted { token } => Self::ServiceStarted(token),
            SessionEvent::ServiceError { message } => Self::ServiceError(message),
            SessionEvent::NotificationReceived { notification } => {
                Self::NotificationReceived(notification)
            }
            SessionEvent::TokenUpdated { token } => Self::TokenUpdated(token),
        }
    }
}
