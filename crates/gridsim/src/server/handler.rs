//! WebSocket Connection Handler
//!
//! Each control client receives every message the relay publishes plus the
//! direct replies to its own requests.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::protocol::ControlMessage;
use super::state::AppState;

/// Handle a WebSocket connection
pub async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ControlMessage>(64);
    let mut published = state.relay().subscribe();

    let session_id = state.register_client(tx).await;

    // Forward direct replies and relay publications to the socket
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                direct = rx.recv() => match direct {
                    Some(msg) => msg,
                    None => break,
                },
                relayed = published.recv() => match relayed {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%session_id, skipped, "Control client lagging");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize control message"),
            }
        }
    });

    let state_clone = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_message(&state_clone, session_id, &text).await;
                }
                Message::Close(_) => {
                    break;
                }
                Message::Ping(_data) => {
                    // Pong is handled automatically by axum
                    tracing::trace!("Received ping from {}", session_id);
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.remove_client(session_id).await;
}

/// Handle a client message
async fn handle_client_message(state: &AppState, session_id: Uuid, text: &str) {
    let msg: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "Failed to parse control message");
            return;
        }
    };

    if let Some(reply) = state.relay().handle_control(msg).await {
        state.send_to_client(session_id, reply);
    }
}
