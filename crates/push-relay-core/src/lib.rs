//! Core abstractions for the push notification relay.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionOwner`, `Credentials`, `DeliveryEvent` - Session data model
//! - `SessionEvent` - Typed outbound event enum
//! - `BackendConfig`, `RelayConfig` - Configuration
//! - Persistence, messaging client and endpoint traits

pub mod config;
pub mod event;
pub mod traits;

pub use config::{BackendConfig, RelayConfig};
pub use event::SessionEvent;
pub use traits::{
    Credentials, DeliveryEvent, DeliveryHandler, Endpoint, KeyValueStore, ListenHandle,
    MessagingClient, SessionOwner, SessionPhase,
};
