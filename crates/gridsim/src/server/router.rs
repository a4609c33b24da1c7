//! HTTP Routes
//!
//! The control WebSocket plus a read-only relay health snapshot.

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use tower_http::cors::CorsLayer;

use super::handler::handle_websocket;
use super::protocol::RelayHealth;
use super::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(control_socket))
        .route("/health", get(relay_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn control_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn relay_health(State(state): State<AppState>) -> Json<RelayHealth> {
    Json(state.relay().health(state.client_count()))
}
