//! Relay endpoints
//!
//! One TCP listener per `(protocol, ip, port)`. Dropping or closing an
//! [`Endpoint`] stops its accept loop and every connection it spawned.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::RelayState;
use super::{RelayError, RelayResult, iec, modbus};
use crate::server::{EndpointHealth, EndpointSpec, EndpointStatus, Protocol};

/// Unique identity of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub protocol: Protocol,
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A bound (or failed) listener
pub struct Endpoint {
    pub key: EndpointKey,
    pub spec: EndpointSpec,
    /// Port actually bound
    pub local_port: Option<u16>,
    pub error: Option<String>,
    clients: Arc<AtomicUsize>,
    shutdown: Option<watch::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Bind and start accepting; a bind failure yields a failed endpoint
    pub(crate) async fn bind(key: EndpointKey, spec: EndpointSpec, relay: RelayState) -> Self {
        let clients = Arc::new(AtomicUsize::new(0));
        match TcpListener::bind((key.ip.as_str(), key.port)).await {
            Ok(listener) => {
                let local_port = listener.local_addr().ok().map(|addr| addr.port());
                let (shutdown_tx, shutdown_rx) = watch::channel(());
                let task = tokio::spawn(accept_loop(
                    listener,
                    key.clone(),
                    spec.clone(),
                    relay,
                    clients.clone(),
                    shutdown_rx,
                ));
                info!(protocol = %key.protocol, endpoint = %key, ?local_port, "Endpoint listening");
                Self {
                    key,
                    spec,
                    local_port,
                    error: None,
                    clients,
                    shutdown: Some(shutdown_tx),
                    task: Some(task),
                }
            }
            Err(source) => {
                let error = RelayError::Bind {
                    addr: key.to_string(),
                    source,
                };
                warn!(protocol = %key.protocol, endpoint = %key, %error, "Endpoint failed");
                Self {
                    key,
                    spec,
                    local_port: None,
                    error: Some(error.to_string()),
                    clients,
                    shutdown: None,
                    task: None,
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.error.is_none()
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            protocol: self.key.protocol,
            ip: self.key.ip.clone(),
            port: self.key.port,
            name: self.spec.name.clone(),
            status: if self.is_active() {
                EndpointHealth::Active
            } else {
                EndpointHealth::Failed
            },
            client_count: self.client_count(),
            local_port: self.local_port,
            error: self.error.clone(),
        }
    }

    /// Stop listening and wait until the socket is released
    pub(crate) async fn close(mut self) {
        drop(self.shutdown.take());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(endpoint = %self.key, "Endpoint closed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connections
// ─────────────────────────────────────────────────────────────────────────────

/// What a connection task knows about where it came from
pub(crate) struct Connection {
    pub relay: RelayState,
    /// `ip:port` label used in traces and commands
    pub endpoint: String,
    pub spec: EndpointSpec,
    pub peer: SocketAddr,
    /// Resolves when the endpoint is torn down
    pub shutdown: watch::Receiver<()>,
}

struct ClientGuard(Arc<AtomicUsize>);

impl ClientGuard {
    fn new(clients: Arc<AtomicUsize>) -> Self {
        clients.fetch_add(1, Ordering::SeqCst);
        Self(clients)
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept_loop(
    listener: TcpListener,
    key: EndpointKey,
    spec: EndpointSpec,
    relay: RelayState,
    clients: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(protocol = %key.protocol, endpoint = %key, %peer, "Client connected");
                    let guard = ClientGuard::new(clients.clone());
                    let connection = Connection {
                        relay: relay.clone(),
                        endpoint: key.to_string(),
                        spec: spec.clone(),
                        peer,
                        shutdown: shutdown.clone(),
                    };
                    tokio::spawn(handle_connection(stream, key.protocol, connection, guard));
                }
                Err(e) => {
                    warn!(endpoint = %key, error = %e, "Accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    protocol: Protocol,
    connection: Connection,
    _guard: ClientGuard,
) {
    let endpoint = connection.endpoint.clone();
    let peer = connection.peer;
    let result = match (connection.spec.backend(), protocol) {
        (Some(backend), _) => proxy(stream, backend, connection).await,
        (None, Protocol::Modbus) => modbus::serve(stream, connection).await,
        (None, Protocol::Iec61850) => iec::serve(stream, connection).await,
    };
    match result {
        Ok(()) => debug!(%endpoint, %peer, "Client disconnected"),
        Err(e) => warn!(%endpoint, %peer, error = %e, "Connection closed"),
    }
}

/// Copy raw bytes between the client and a real device
async fn proxy(
    mut client: TcpStream,
    backend: String,
    mut connection: Connection,
) -> RelayResult<()> {
    let mut upstream = TcpStream::connect(&backend)
        .await
        .map_err(|source| RelayError::Backend {
            addr: backend.clone(),
            source,
        })?;
    debug!(endpoint = %connection.endpoint, %backend, "Proxying");
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            let (up, down) = copied?;
            debug!(endpoint = %connection.endpoint, up, down, "Proxy finished");
        }
        _ = connection.shutdown.changed() => {}
    }
    Ok(())
}
