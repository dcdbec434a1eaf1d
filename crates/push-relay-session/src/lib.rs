//! Session orchestration and storage for the push notification relay.
//!
//! Provides:
//! - `NotificationService` - The single-session state machine
//! - `NotificationRelay` - Checkpoint-then-forward delivery handler
//! - `CredentialStore` - Per-owner durable state
//! - Key-value store implementations (memory, JSON file)

pub mod credentials;
pub mod manager;
pub mod relay;
pub mod storage;

pub use credentials::CredentialStore;
pub use manager::{NotificationService, StartAttempt, StartError};
pub use relay::{NotificationRelay, RelayOutcome};
