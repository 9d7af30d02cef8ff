//! `WebSocket` tick stream.
//!
//! Clients connect to `GET /ws/ticks`. They first receive a `hello` frame
//! with the current tick, then one [`TickBroadcast`] per completed tick.
//! A client that lags behind the broadcast buffer skips to the newest
//! tick; delivery is best-effort.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::state::{AppState, TickBroadcast};

/// Upgrade to a `WebSocket` and stream ticks.
///
/// # Route
///
/// `GET /ws/ticks`
pub async fn ws_ticks(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| stream_ticks(socket, state))
}

async fn stream_ticks(mut socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before reading the view so no tick falls in between.
    let mut rx = state.subscribe();
    let tick = state.world().await.map_or(0, |world| world.tick);
    let hello = serde_json::json!({ "type": "hello", "tick": tick }).to_string();
    if socket.send(Message::Text(hello.into())).await.is_err() {
        return;
    }
    debug!(tick, "WebSocket client connected");

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) => {
                    if !send_tick(&mut socket, &message).await {
                        debug!("WebSocket client disconnected (send failed)");
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "WebSocket client lagged, skipping ahead");
                }
                Err(RecvError::Closed) => {
                    debug!("Tick broadcast closed, ending WebSocket stream");
                    return;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket client disconnected");
                    return;
                }
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    debug!(error = %err, "WebSocket error");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Returns `false` once the client is gone.
async fn send_tick(socket: &mut WebSocket, message: &TickBroadcast) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            warn!(tick = message.tick, error = %err, "Failed to serialize tick broadcast");
            true
        }
    }
}
