//! Routing of inbound commands to the notification service.

use std::sync::Arc;

use push_relay_core::{Endpoint, MessagingClient, SessionEvent};
use push_relay_session::NotificationService;

use crate::{bridge::BridgeSession, protocol::InboundCommand};

/// What the transport should do with the connection after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep reading commands.
    Continue,
    /// Close the sending context's connection.
    Close,
}

/// Apply one command from the context behind `endpoint`.
///
/// The session is claimed before this returns, so commands take effect in
/// arrival order; registration and listen then proceed on a spawned task
/// and a later stop can supersede them.
pub async fn dispatch<M>(
    service: &Arc<NotificationService<M>>,
    command: InboundCommand,
    endpoint: Arc<dyn Endpoint>,
) -> Dispatch
where
    M: MessagingClient + 'static,
{
    tracing::debug!(channel = command.channel(), "Dispatching command");

    match command {
        InboundCommand::StartService(payload) => {
            if let Some(attempt) = service
                .claim(payload.owner, payload.backend_config, endpoint)
                .await
            {
                let service = Arc::clone(service);
                tokio::spawn(async move { service.complete(attempt).await });
            }
            Dispatch::Continue
        }
        InboundCommand::StopService => {
            service.stop().await;
            Dispatch::Continue
        }
        InboundCommand::DestroyService => {
            service.stop().await;
            tracing::info!("Notification service destroyed by context");
            Dispatch::Close
        }
    }
}

/// Decode one text frame from the context behind `endpoint` and apply it.
///
/// An undecodable frame is answered with `service-error` and the connection
/// stays open.
pub async fn handle_frame<M>(
    service: &Arc<NotificationService<M>>,
    text: &str,
    endpoint: Arc<dyn Endpoint>,
) -> Dispatch
where
    M: MessagingClient + 'static,
{
    match InboundCommand::decode(text) {
        Ok(command) => dispatch(service, command, endpoint).await,
        Err(e) => {
            tracing::warn!("{e}");
            if let Err(send_err) = endpoint.send(SessionEvent::error(e.to_string())) {
                tracing::warn!("Failed to report invalid frame: {send_err}");
            }
            Dispatch::Continue
        }
    }
}

/// Serve commands from an in-process bridge until it closes or destroys.
pub async fn serve_bridge<M>(service: Arc<NotificationService<M>>, mut session: BridgeSession)
where
    M: MessagingClient + 'static,
{
    let endpoint: Arc<dyn Endpoint> = session.endpoint.clone();
    while let Some(command) = session.recv().await {
        if dispatch(&service, command, Arc::clone(&endpoint)).await == Dispatch::Close {
            break;
        }
    }
}
