//! Outbound session events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event emitted by the session manager toward a presentation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Listening, or already listening, with this token.
    ServiceStarted { token: String },
    /// A start attempt failed.
    ServiceError { message: String },
    /// A notification was relayed.
    NotificationReceived { notification: Value },
    /// Registration produced a new token.
    TokenUpdated { token: String },
}

impl SessionEvent {
    #[must_use]
    pub fn started(token: impl Into<String>) -> Self {
        Self::ServiceStarted {
            token: token.into(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::ServiceError {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn token_updated(token: impl Into<String>) -> Self {
        Self::TokenUpdated {
            token: token.into(),
        }
    }

    #[must_use]
    pub const fn notification(notification: Value) -> Self {
        Self::NotificationReceived { notification }
    }
}
