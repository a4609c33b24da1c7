//! Server Application State
//!
//! Shared state accessible by all WebSocket handlers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::ControlMessage;
use crate::relay::RelayState;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    relay: RelayState,

    /// Connected control clients
    clients: DashMap<Uuid, ClientState>,
}

/// Per-client state
#[derive(Debug, Clone)]
pub struct ClientState {
    pub session_id: Uuid,

    /// Channel to send messages to this client
    pub tx: mpsc::Sender<ControlMessage>,
}

impl AppState {
    pub fn new(relay: RelayState) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                relay,
                clients: DashMap::new(),
            }),
        }
    }

    pub fn relay(&self) -> &RelayState {
        &self.inner.relay
    }

    /// Register a new client connection
    pub async fn register_client(&self, tx: mpsc::Sender<ControlMessage>) -> Uuid {
        let session_id = Uuid::new_v4();
        self.inner
            .clients
            .insert(session_id, ClientState { session_id, tx });
        tracing::info!(%session_id, "Control client connected");

        if self.inner.relay.settings().reset_on_connect {
            self.inner.relay.reset_endpoints().await;
        }
        session_id
    }

    /// Remove a client connection
    pub async fn remove_client(&self, session_id: Uuid) {
        self.inner.clients.remove(&session_id);
        tracing::info!(%session_id, "Control client disconnected");
    }

    /// Get the number of connected clients
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Send a message to a specific client
    pub fn send_to_client(&self, session_id: Uuid, message: ControlMessage) {
        if let Some(client) = self.inner.clients.get(&session_id) {
            if let Err(e) = client.tx.try_send(message) {
                tracing::warn!(%session_id, error = %e, "Failed to send message to client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelaySettings;
    use crate::server::{EndpointSpec, Protocol};

    async fn relay_with_listener(reset_on_connect: bool) -> RelayState {
        let relay = RelayState::new(RelaySettings {
            reset_on_connect,
            ..RelaySettings::default()
        });
        relay
            .set_protocol_endpoints(Protocol::Modbus, vec![EndpointSpec::new("127.0.0.1", 0)])
            .await;
        relay
    }

    #[tokio::test]
    async fn test_connect_resets_endpoints() {
        let state = AppState::new(relay_with_listener(true).await);
        let (tx, _rx) = mpsc::channel(8);

        state.register_client(tx).await;
        assert_eq!(state.client_count(), 1);
        assert!(state.relay().endpoint_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_connect_keeps_endpoints_by_default() {
        let state = AppState::new(relay_with_listener(false).await);
        let (tx, _rx) = mpsc::channel(8);

        let session_id = state.register_client(tx).await;
        assert_eq!(state.relay().endpoint_statuses().len(), 1);

        state.remove_client(session_id).await;
        assert_eq!(state.client_count(), 0);
    }
}
