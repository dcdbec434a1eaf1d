//! Transport layer between the host process and presentation contexts.
//!
//! Provides:
//! - Wire protocol (named JSON messages)
//! - Command dispatch into the notification service
//! - In-process channel bridge
//! - WebSocket transport (feature: websocket)

pub mod bridge;
pub mod dispatch;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use bridge::{ChannelBridge, ChannelEndpoint};
pub use dispatch::{Dispatch, dispatch, handle_frame, serve_bridge};
pub use protocol::{InboundCommand, OutboundEvent};
