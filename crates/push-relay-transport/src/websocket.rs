//! WebSocket transport: one connection per presentation context.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use push_relay_core::{Endpoint, MessagingClient};
use push_relay_session::NotificationService;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    bridge::ChannelEndpoint,
    dispatch::{Dispatch, handle_frame},
    protocol::OutboundEvent,
};

/// WebSocket handler state.
pub struct WsState<M>
where
    M: MessagingClient,
{
    /// The notification service shared by all connections.
    pub service: Arc<NotificationService<M>>,
}

impl<M> Clone for WsState<M>
where
    M: MessagingClient,
{
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

impl<M> WsState<M>
where
    M: MessagingClient,
{
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(service: Arc<NotificationService<M>>) -> Self {
        Self { service }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<M>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<M>>,
) -> impl IntoResponse
where
    M: MessagingClient + 'static,
{
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket<M>(socket: WebSocket, state: WsState<M>)
where
    M: MessagingClient + 'static,
{
    let (mut sender, mut receiver) = socket.split();
    let ws_id = Uuid::new_v4();

    // Dropping `rx` makes the endpoint unreachable for the relay.
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();
    let endpoint: Arc<dyn Endpoint> = Arc::new(ChannelEndpoint::new(tx));

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match event.encode() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("{e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::info!(%ws_id, "Presentation context connected");

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(%ws_id, "WebSocket error: {e}");
                break;
            }
        };

        if handle_frame(&state.service, &text, Arc::clone(&endpoint)).await == Dispatch::Close {
            tracing::debug!(%ws_id, "Closing connection on destroy");
            break;
        }
    }

    send_task.abort();
    tracing::info!(%ws_id, "Presentation context disconnected");
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(service));
/// ```
#[must_use]
pub fn create_ws_router<M>(service: Arc<NotificationService<M>>) -> axum::Router
where
    M: MessagingClient + 'static,
{
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<M>))
        .with_state(WsState::new(service))
}
