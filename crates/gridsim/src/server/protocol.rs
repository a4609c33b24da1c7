//! Control-Plane Protocol Messages
//!
//! JSON messages exchanged between the engine and the protocol relay over
//! the control channel, tagged by `type`.

use chrono::{DateTime, Utc};
use gridsim_types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// Every control-plane message, in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Ask the relay which local addresses it can bind
    GetAdapters,

    AdapterList {
        adapters: Vec<Adapter>,
    },

    /// Bind IP used by endpoints that do not name one
    BindAdapter {
        ip: String,
    },

    /// Replace every listener of one protocol
    SetProtocolEndpoints {
        protocol: Protocol,
        endpoints: Vec<EndpointSpec>,
    },

    GetEndpointStatus,

    EndpointStatusList {
        endpoints: Vec<EndpointStatus>,
    },

    /// The relay needs an IED model to answer MMS name queries
    GetIedModel,

    IedModel {
        model: IedNode,
    },

    /// A decoded Modbus request for the engine
    ModbusCmd {
        #[serde(rename = "requestId")]
        request_id: u16,
        endpoint: String,
        #[serde(rename = "unitId")]
        unit_id: u8,
        #[serde(rename = "functionCode")]
        function_code: u8,
        address: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quantity: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },

    /// The engine's answer to a `MODBUS_CMD`
    ModbusResp {
        #[serde(rename = "requestId")]
        request_id: u16,
        #[serde(rename = "functionCode")]
        function_code: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        values: Option<Vec<Value>>,
        #[serde(
            rename = "exceptionCode",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        exception_code: Option<u8>,
    },

    ModbusTrace {
        direction: TraceDirection,
        endpoint: String,
        #[serde(rename = "transactionId")]
        transaction_id: u16,
        #[serde(rename = "functionCode")]
        function_code: u8,
        hex: String,
        timestamp: DateTime<Utc>,
    },

    IecTrace {
        direction: TraceDirection,
        endpoint: String,
        kind: String,
        hex: String,
        timestamp: DateTime<Utc>,
    },

    /// A control object was operated
    ControlUpdate {
        path: String,
        client: String,
        value: Value,
        /// Simulation time of the operate
        #[serde(rename = "timeMs")]
        time_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ControlMessage {
    /// Value of the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::GetAdapters => "GET_ADAPTERS",
            ControlMessage::AdapterList { .. } => "ADAPTER_LIST",
            ControlMessage::BindAdapter { .. } => "BIND_ADAPTER",
            ControlMessage::SetProtocolEndpoints { .. } => "SET_PROTOCOL_ENDPOINTS",
            ControlMessage::GetEndpointStatus => "GET_ENDPOINT_STATUS",
            ControlMessage::EndpointStatusList { .. } => "ENDPOINT_STATUS_LIST",
            ControlMessage::GetIedModel => "GET_IED_MODEL",
            ControlMessage::IedModel { .. } => "IED_MODEL",
            ControlMessage::ModbusCmd { .. } => "MODBUS_CMD",
            ControlMessage::ModbusResp { .. } => "MODBUS_RESP",
            ControlMessage::ModbusTrace { .. } => "MODBUS_TRACE",
            ControlMessage::IecTrace { .. } => "IEC_TRACE",
            ControlMessage::ControlUpdate { .. } => "CONTROL_UPDATE",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// Relay protocols
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Iec61850,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Modbus, Protocol::Iec61850];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Modbus => f.write_str("modbus"),
            Protocol::Iec61850 => f.write_str("iec61850"),
        }
    }
}

/// Requested listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EndpointSpec {
    /// Empty means the bound adapter
    #[serde(default)]
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Overrides the unit id of incoming Modbus requests
    #[serde(
        rename = "unitId",
        alias = "unit_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unit_id: Option<u8>,
    /// Proxy to a real device instead of simulating
    #[serde(
        rename = "backendHost",
        alias = "backend_host",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub backend_host: Option<String>,
    #[serde(
        rename = "backendPort",
        alias = "backend_port",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub backend_port: Option<u16>,
}

impl EndpointSpec {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            name: None,
            unit_id: None,
            backend_host: None,
            backend_port: None,
        }
    }

    /// `host:port` of the proxy backend, when configured
    pub fn backend(&self) -> Option<String> {
        let host = self.backend_host.as_deref().filter(|h| !h.is_empty())?;
        Some(format!("{host}:{}", self.backend_port.unwrap_or(self.port)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum EndpointHealth {
    Active,
    Failed,
}

/// Reported state of one listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EndpointStatus {
    pub protocol: Protocol,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: EndpointHealth,
    #[serde(rename = "clientCount")]
    pub client_count: usize,
    /// Port actually bound (differs from `port` when `port` is 0)
    #[serde(rename = "localPort", default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall listener condition of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum RelayCondition {
    /// No listener configured
    Idle,
    Serving,
    /// At least one listener failed to bind
    Degraded,
}

/// Relay snapshot served over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RelayHealth {
    pub condition: RelayCondition,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(rename = "controlClients")]
    pub control_clients: usize,
    #[serde(rename = "pendingRequests")]
    pub pending_requests: usize,
    #[serde(rename = "modbusListeners")]
    pub modbus_listeners: usize,
    #[serde(rename = "iec61850Listeners")]
    pub iec61850_listeners: usize,
    pub endpoints: Vec<EndpointStatus>,
}

impl RelayHealth {
    /// Summarise listener statuses; only active listeners are counted per protocol
    pub fn summarise(endpoints: Vec<EndpointStatus>) -> Self {
        let active = |protocol: Protocol| {
            endpoints
                .iter()
                .filter(|e| e.protocol == protocol && e.status == EndpointHealth::Active)
                .count()
        };
        let condition = if endpoints.is_empty() {
            RelayCondition::Idle
        } else if endpoints.iter().any(|e| e.status == EndpointHealth::Failed) {
            RelayCondition::Degraded
        } else {
            RelayCondition::Serving
        };
        Self {
            condition,
            version: env!("CARGO_PKG_VERSION").to_string(),
            adapter: None,
            control_clients: 0,
            pending_requests: 0,
            modbus_listeners: active(Protocol::Modbus),
            iec61850_listeners: active(Protocol::Iec61850),
            endpoints,
        }
    }
}

/// A bindable local address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Adapter {
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum TraceDirection {
    In,
    Out,
}

// ─────────────────────────────────────────────────────────────────────────────
// IED model
// ─────────────────────────────────────────────────────────────────────────────

/// One node of an IED model document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct IedNode {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<IedNode>,
}

impl IedNode {
    fn is_kind(&self, kind: &str) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case(kind))
    }

    /// Typed `LD`, or holding an `LN`-typed child
    pub fn is_logical_device(&self) -> bool {
        self.is_kind("LD") || self.children.iter().any(|c| c.is_kind("LN"))
    }

    /// Logical devices in depth-first order
    pub fn logical_devices(&self) -> Vec<&IedNode> {
        let mut found = Vec::new();
        self.collect_logical_devices(&mut found);
        found
    }

    fn collect_logical_devices<'a>(&'a self, found: &mut Vec<&'a IedNode>) {
        if self.is_logical_device() {
            found.push(self);
            return;
        }
        for child in &self.children {
            child.collect_logical_devices(found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_screaming_snake_case() {
        let json = serde_json::to_value(ControlMessage::GetIedModel).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "GET_IED_MODEL" }));

        let msg: ControlMessage = serde_json::from_str(
            r#"{"type":"SET_PROTOCOL_ENDPOINTS","protocol":"iec61850",
                "endpoints":[{"ip":"127.0.0.1","port":102,"backendHost":"10.0.0.5"}]}"#,
        )
        .unwrap();
        let ControlMessage::SetProtocolEndpoints {
            protocol,
            endpoints,
        } = msg
        else {
            panic!("wrong variant");
        };
        assert_eq!(protocol, Protocol::Iec61850);
        assert_eq!(endpoints[0].backend().as_deref(), Some("10.0.0.5:102"));
    }

    #[test]
    fn test_modbus_resp_field_names() {
        let msg = ControlMessage::ModbusResp {
            request_id: 7,
            function_code: 3,
            values: Some(vec![Value::Int(50), Value::Int(1000)]),
            exception_code: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({
                "type": "MODBUS_RESP",
                "requestId": 7,
                "functionCode": 3,
                "values": [50, 1000]
            })
        );
        assert_eq!(msg.kind(), "MODBUS_RESP");
    }

    #[test]
    fn test_first_logical_device() {
        let model: IedNode = serde_json::from_value(serde_json::json!({
            "name": "IED1",
            "type": "IED",
            "children": [
                { "name": "IED1LD0", "children": [{ "name": "LLN0", "type": "LN" }] },
                { "name": "IED1PROT", "type": "LD" }
            ]
        }))
        .unwrap();
        let lds = model.logical_devices();
        assert_eq!(
            lds.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
            vec!["IED1LD0", "IED1PROT"]
        );
    }
}
