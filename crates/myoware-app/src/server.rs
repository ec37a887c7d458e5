//! WebSocket forwarding server.
//!
//! Every event published by the coordinator in host-forwarding mode is
//! sent to each connected client as a text frame:
//!
//! ```json
//! {"event":"emg_data","data":{"timestamp":"...","deviceId":"...","value":1234}}
//! ```

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use myoware_native::streaming::{BroadcastPublisher, EventEnvelope};

struct AppState {
    publisher: BroadcastPublisher,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.publisher.subscribe();
    info!("WebSocket client connected");

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&EventEnvelope::emg(&event)) else {
                        continue;
                    };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Client lagged, dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            result = socket.recv() => match result {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                _ => {}
            },
        }
    }

    info!("WebSocket client disconnected");
}

/// Serve forwarded events on `/ws` until the listener fails.
pub async fn serve(listener: TcpListener, publisher: BroadcastPublisher) -> anyhow::Result<()> {
    let state = Arc::new(AppState { publisher });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route(
            "/health",
            get(|| async { axum::Json(serde_json::json!({"status": "ok"})) }),
        )
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state);

    info!("WebSocket endpoint: ws://{}/ws", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
