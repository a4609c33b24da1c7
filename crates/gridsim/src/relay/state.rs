//! Relay state
//!
//! Shared handle over every live listener, the Modbus requests waiting on
//! the engine, and the outbound side of the control channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use gridsim_types::Value;
use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::endpoint::{Endpoint, EndpointKey};
use super::modbus::{PendingRequest, response_for};
use super::{RelaySettings, list_adapters};
use crate::modbus::{ExceptionCode, Response};
use crate::server::{
    ControlMessage, EndpointSpec, EndpointStatus, IedNode, Protocol, RelayHealth, TraceDirection,
};
use crate::substation::ControlUpdate;

/// Cheap to clone; every clone shares the same relay
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    settings: RelaySettings,
    endpoints: DashMap<EndpointKey, Endpoint>,
    /// Last endpoint set requested per protocol, replayed on BIND_ADAPTER
    requested: DashMap<Protocol, Vec<EndpointSpec>>,
    pending: DashMap<u16, PendingRequest>,
    outbound: broadcast::Sender<ControlMessage>,
    ied_model: RwLock<Option<IedNode>>,
    adapter_ip: RwLock<Option<String>>,
    /// Rebinds never interleave
    rebind: Mutex<()>,
}

impl RelayState {
    pub fn new(settings: RelaySettings) -> Self {
        let (outbound, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RelayInner {
                settings,
                endpoints: DashMap::new(),
                requested: DashMap::new(),
                pending: DashMap::new(),
                outbound,
                ied_model: RwLock::new(None),
                adapter_ip: RwLock::new(None),
                rebind: Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.inner.settings
    }

    /// Receive everything the relay sends toward the engine
    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.inner.outbound.subscribe()
    }

    /// Returns false when nobody is listening
    pub fn publish(&self, msg: ControlMessage) -> bool {
        self.inner.outbound.send(msg).is_ok()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control channel
    // ─────────────────────────────────────────────────────────────────────

    /// Apply one inbound message; the return value is the direct reply
    pub async fn handle_control(&self, msg: ControlMessage) -> Option<ControlMessage> {
        debug!(kind = msg.kind(), "Control message");
        match msg {
            ControlMessage::GetAdapters => Some(ControlMessage::AdapterList {
                adapters: list_adapters(),
            }),
            ControlMessage::BindAdapter { ip } => {
                info!(%ip, "Binding adapter");
                *self.inner.adapter_ip.write() = Some(ip).filter(|ip| !ip.is_empty());
                for protocol in Protocol::ALL {
                    let specs = self
                        .inner
                        .requested
                        .get(&protocol)
                        .map(|specs| specs.clone())
                        .unwrap_or_default();
                    self.set_protocol_endpoints(protocol, specs).await;
                }
                None
            }
            ControlMessage::SetProtocolEndpoints {
                protocol,
                endpoints,
            } => {
                self.set_protocol_endpoints(protocol, endpoints).await;
                None
            }
            ControlMessage::GetEndpointStatus => Some(ControlMessage::EndpointStatusList {
                endpoints: self.endpoint_statuses(),
            }),
            ControlMessage::IedModel { model } => {
                info!(ied = %model.name, "IED model received");
                *self.inner.ied_model.write() = Some(model);
                None
            }
            ControlMessage::ModbusResp {
                request_id,
                function_code,
                values,
                exception_code,
            } => {
                self.complete_modbus(request_id, function_code, values, exception_code)
                    .await;
                None
            }
            other => {
                debug!(kind = other.kind(), "Ignoring message meant for the engine");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Endpoints
    // ─────────────────────────────────────────────────────────────────────

    /// Replace every listener of `protocol`
    ///
    /// Old listeners are fully closed before any new one binds, so a port
    /// can move between adapters in a single call.
    pub async fn set_protocol_endpoints(&self, protocol: Protocol, specs: Vec<EndpointSpec>) {
        let _guard = self.inner.rebind.lock().await;
        self.inner.requested.insert(protocol, specs.clone());

        let stale: Vec<EndpointKey> = self
            .inner
            .endpoints
            .iter()
            .filter(|entry| entry.key().protocol == protocol)
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            if let Some((_, endpoint)) = self.inner.endpoints.remove(&key) {
                endpoint.close().await;
            }
        }

        let specs = if specs.is_empty() && self.inner.settings.allow_default_listeners {
            vec![EndpointSpec::new("", self.default_port(protocol))]
        } else {
            specs
        };

        for spec in specs {
            let key = EndpointKey {
                protocol,
                ip: self.resolve_ip(&spec.ip),
                port: spec.port,
            };
            if self.inner.endpoints.contains_key(&key) {
                warn!(%protocol, endpoint = %key, "Duplicate endpoint ignored");
                continue;
            }
            let endpoint = Endpoint::bind(key.clone(), spec, self.clone()).await;
            self.inner.endpoints.insert(key, endpoint);
        }

        self.publish(ControlMessage::EndpointStatusList {
            endpoints: self.endpoint_statuses(),
        });

        let serving_iec = self
            .inner
            .endpoints
            .iter()
            .any(|entry| entry.key().protocol == Protocol::Iec61850 && entry.is_active());
        if serving_iec && self.inner.ied_model.read().is_none() {
            self.publish(ControlMessage::GetIedModel);
        }
    }

    /// Drop every listener, as on a fresh control connection
    pub async fn reset_endpoints(&self) {
        for protocol in Protocol::ALL {
            self.set_protocol_endpoints(protocol, Vec::new()).await;
        }
    }

    pub fn endpoint_statuses(&self) -> Vec<EndpointStatus> {
        let mut statuses: Vec<(EndpointKey, EndpointStatus)> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| (entry.key().clone(), entry.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses.into_iter().map(|(_, status)| status).collect()
    }

    /// Listener summary plus relay bookkeeping
    pub fn health(&self, control_clients: usize) -> RelayHealth {
        RelayHealth {
            adapter: self.inner.adapter_ip.read().clone(),
            control_clients,
            pending_requests: self.pending_count(),
            ..RelayHealth::summarise(self.endpoint_statuses())
        }
    }

    fn default_port(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Modbus => self.inner.settings.modbus_default_port,
            Protocol::Iec61850 => self.inner.settings.iec61850_default_port,
        }
    }

    /// Empty ip means the bound adapter, or every interface
    fn resolve_ip(&self, ip: &str) -> String {
        if !ip.is_empty() {
            return ip.to_string();
        }
        self.inner
            .adapter_ip
            .read()
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    // ─────────────────────────────────────────────────────────────────────
    // IED model
    // ─────────────────────────────────────────────────────────────────────

    pub fn ied_model(&self) -> Option<IedNode> {
        self.inner.ied_model.read().clone()
    }

    /// First logical device name and how many there are
    pub fn logical_devices(&self) -> (Option<String>, usize) {
        match self.inner.ied_model.read().as_ref() {
            Some(model) => {
                let lds = model.logical_devices();
                (lds.first().map(|ld| ld.name.clone()), lds.len())
            }
            None => (None, 0),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pending Modbus requests
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn insert_pending(
        &self,
        transaction_id: u16,
        pending: PendingRequest,
    ) -> Option<PendingRequest> {
        self.inner.pending.insert(transaction_id, pending)
    }

    pub(crate) fn take_pending(&self, transaction_id: u16) -> Option<PendingRequest> {
        self.inner.pending.remove(&transaction_id).map(|(_, p)| p)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Answer the client waiting on `request_id`
    pub async fn complete_modbus(
        &self,
        request_id: u16,
        function_code: u8,
        values: Option<Vec<Value>>,
        exception_code: Option<u8>,
    ) {
        let Some(pending) = self.take_pending(request_id) else {
            debug!(request_id, "Response for unknown or expired request");
            return;
        };
        if function_code & 0x7F != pending.request.function().code() {
            debug!(
                request_id,
                function_code,
                expected = pending.request.function().code(),
                "Function code mismatch in response"
            );
        }
        let response = response_for(&pending.request, values, exception_code);
        self.send_reply(request_id, pending, &response).await;
    }

    /// Fail every request older than the configured timeout
    pub async fn sweep_pending(&self) -> usize {
        let timeout = Duration::from_millis(self.inner.settings.request_timeout_ms);
        let now = Instant::now();
        let expired: Vec<u16> = self
            .inner
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.created) >= timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut swept = 0;
        for transaction_id in expired {
            let Some(pending) = self.take_pending(transaction_id) else {
                continue;
            };
            swept += 1;
            warn!(transaction_id, endpoint = %pending.endpoint, "Modbus request timed out");
            let response = Response::exception(
                pending.request.function().code(),
                ExceptionCode::ServerDeviceFailure,
            );
            self.send_reply(transaction_id, pending, &response).await;
        }
        swept
    }

    /// Run [`Self::sweep_pending`] forever
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let relay = self.clone();
        let period = Duration::from_millis(relay.inner.settings.sweep_interval_ms.max(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                relay.sweep_pending().await;
            }
        })
    }

    async fn send_reply(&self, transaction_id: u16, pending: PendingRequest, response: &Response) {
        if pending.reply.is_closed() {
            debug!(transaction_id, "Client gone before reply");
            return;
        }
        let bytes = pending.reply_adu(transaction_id, response);
        self.trace_modbus(
            TraceDirection::Out,
            &pending.endpoint,
            transaction_id,
            response.function_byte(),
            &bytes,
        );
        if pending.reply.send(bytes).await.is_err() {
            debug!(transaction_id, "Client gone before reply");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Traces
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn trace_modbus(
        &self,
        direction: TraceDirection,
        endpoint: &str,
        transaction_id: u16,
        function_code: u8,
        bytes: &[u8],
    ) {
        self.publish(ControlMessage::ModbusTrace {
            direction,
            endpoint: endpoint.to_string(),
            transaction_id,
            function_code,
            hex: hex::encode(bytes),
            timestamp: Utc::now(),
        });
    }

    /// Forward an operate to every control client
    pub fn publish_control_update(&self, update: ControlUpdate) {
        self.publish(ControlMessage::ControlUpdate {
            path: update.path,
            client: update.client,
            value: update.value,
            time_ms: update.at_ms,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn trace_iec(
        &self,
        direction: TraceDirection,
        endpoint: &str,
        kind: &str,
        bytes: &[u8],
    ) {
        self.publish(ControlMessage::IecTrace {
            direction,
            endpoint: endpoint.to_string(),
            kind: kind.to_string(),
            hex: hex::encode(bytes),
            timestamp: Utc::now(),
        });
    }
}
