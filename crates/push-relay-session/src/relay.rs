//! Checkpointing relay between a listen handle and a presentation context.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use push_relay_core::{
    DeliveryEvent, DeliveryHandler, Endpoint, SessionEvent, SessionOwner, traits::TransportError,
};

use crate::CredentialStore;

/// Outcome of relaying one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Checkpointed and forwarded.
    Forwarded,
    /// Checkpointed, but the destination was gone.
    Dropped,
    /// The relay was closed; nothing happened.
    Ignored,
}

/// Delivery handler wired to one listen handle.
///
/// Every delivery is checkpointed before it is forwarded, so a crash in
/// between loses the notification for the presentation layer but never
/// makes the backend redeliver it.
pub struct NotificationRelay {
    owner: SessionOwner,
    store: CredentialStore,
    endpoint: Arc<dyn Endpoint>,
    closed: AtomicBool,
}

impl NotificationRelay {
    #[must_use]
    pub fn new(owner: SessionOwner, store: CredentialStore, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            owner,
            store,
            endpoint,
            closed: AtomicBool::new(false),
        }
    }

    /// Stop relaying. Later deliveries are ignored.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Checkpoint then forward one delivery.
    pub fn relay(&self, event: DeliveryEvent) -> RelayOutcome {
        if self.is_closed() {
            tracing::debug!(
                owner = %self.owner,
                delivery_id = %event.delivery_id,
                "Ignoring delivery on closed relay"
            );
            return RelayOutcome::Ignored;
        }

        if let Err(e) = self.store.append_checkpoint(&self.owner, &event.delivery_id) {
            tracing::error!(
                owner = %self.owner,
                delivery_id = %event.delivery_id,
                "Failed to persist checkpoint: {e}"
            );
        }

        match self.forward(event.notification) {
            Ok(()) => RelayOutcome::Forwarded,
            Err(e) => {
                tracing::warn!(
                    owner = %self.owner,
                    delivery_id = %event.delivery_id,
                    "{e}. Notification will not be sent"
                );
                RelayOutcome::Dropped
            }
        }
    }

    fn forward(&self, notification: serde_json::Value) -> Result<(), TransportError> {
        if !self.endpoint.is_alive() {
            return Err(TransportError::Unreachable);
        }
        self.endpoint.send(SessionEvent::notification(notification))
    }
}

impl DeliveryHandler for NotificationRelay {
    fn on_delivery(&self, event: DeliveryEvent) {
        self.relay(event);
    }
}
