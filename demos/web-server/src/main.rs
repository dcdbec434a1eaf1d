//! Example relay server with a simulated messaging backend.
//!
//! Run with: cargo run -p web-server-demo
//!
//! Then open http://localhost:3000 in your browser. Set `PUSH_RELAY_STORE`
//! and `PUSH_RELAY_ADDR` to override the store file and bind address.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{Router, response::Html, routing::get};
use push_relay_core::{
    BackendConfig, Credentials, DeliveryEvent, DeliveryHandler, ListenHandle, MessagingClient,
    RelayConfig,
    traits::{ListenError, RegistrationError},
};
use push_relay_session::{CredentialStore, NotificationService, storage::JsonFileStore};
use push_relay_transport::websocket::create_ws_router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Backend stand-in that emits a notification every few seconds.
struct SimulatedBackend {
    interval: Duration,
}

struct SimulatedHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ListenHandle for SimulatedHandle {
    fn destroy(self: Box<Self>) {
        self.task.abort();
    }
}

#[async_trait]
impl MessagingClient for SimulatedBackend {
    async fn register(&self, config: &BackendConfig) -> Result<Credentials, RegistrationError> {
        if config.sender_id.trim().is_empty() {
            return Err(RegistrationError::InvalidConfig("senderId is empty".to_string()));
        }

        let mut delivery = serde_json::Map::new();
        delivery.insert("deviceId".to_string(), Uuid::new_v4().to_string().into());

        Ok(Credentials::new(format!("sim-{}", Uuid::new_v4()), config.sender_id.clone())
            .with_delivery(delivery))
    }

    async fn listen(
        &self,
        credentials: &Credentials,
        checkpoints: &[String],
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn ListenHandle>, ListenError> {
        tracing::info!(
            token = %credentials.token,
            checkpoints = checkpoints.len(),
            "Simulated backend listening"
        );

        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            for n in 1_u64.. {
                ticker.tick().await;
                handler.on_delivery(DeliveryEvent::new(
                    Uuid::new_v4().to_string(),
                    serde_json::json!({
                        "title": "Simulated notification",
                        "body": format!("Notification #{n}"),
                    }),
                ));
            }
        });

        Ok(Box::new(SimulatedHandle { task }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::from_env()?;
    let kv = JsonFileStore::open(&config.store_path)
        .with_context(|| format!("Failed to open store at {}", config.store_path.display()))?;
    tracing::info!("Using store {}", kv.path().display());

    let backend = SimulatedBackend {
        interval: Duration::from_secs(5),
    };
    let service = Arc::new(NotificationService::new(
        backend,
        CredentialStore::new(Arc::new(kv)),
    ));

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(Arc::clone(&service)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("Server listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    service.stop().await;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Push Relay</title>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; color: #d4d4d4; font-family: system-ui, sans-serif; }
        h1 { color: #fff; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        #log { font-family: Menlo, Monaco, monospace; white-space: pre-wrap; }
    </style>
</head>
<body>
    <h1>Push Relay</h1>
    <div class="status" id="status">Connecting...</div>
    <button id="start">Start</button>
    <button id="stop">Stop</button>
    <div id="log"></div>

    <script>
        const PREFIX = 'PUSH_RECEIVER:::';
        const status = document.getElementById('status');
        const log = document.getElementById('log');
        let ws;

        function append(line) {
            log.textContent = line + '\n' + log.textContent;
        }

        function send(channel, payload) {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify({ channel: PREFIX + channel, payload }));
            }
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);

            ws.onopen = () => {
                status.textContent = 'Connected';
                status.className = 'status connected';
            };

            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => {
                try {
                    const msg = JSON.parse(event.data);
                    append(`${msg.channel.replace(PREFIX, '')}: ${JSON.stringify(msg.payload)}`);
                } catch (e) {
                    console.error('Failed to parse message:', e);
                }
            };
        }

        document.getElementById('start').onclick = () =>
            send('START_NOTIFICATION_SERVICE', { backendConfig: { senderId: 'demo-sender' }, owner: 'demo-user' });
        document.getElementById('stop').onclick = () => send('STOP_NOTIFICATION_SERVICE');

        connect();
    </script>
</body>
</html>
"#;
