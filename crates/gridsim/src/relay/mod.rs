//! Protocol Relay
//!
//! Real TCP listeners for Modbus and IEC 61850 clients. Modbus requests are
//! decoded here and forwarded to the engine over the control channel; MMS
//! associations are answered locally or proxied to a real backend.
//!
//! ```text
//!  client ──TCP──▶ listener ──▶ connection task ──MODBUS_CMD──▶ engine
//!                                     ▲                           │
//!                                     └────────MODBUS_RESP────────┘
//! ```

mod adapters;
mod endpoint;
mod iec;
pub mod mms;
mod modbus;
mod state;

pub use adapters::*;
pub use endpoint::*;
pub use state::*;

use std::io;

use serde::{Deserialize, Serialize};

/// Relay tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Address of the control-plane WebSocket server
    pub control_host: String,
    pub control_port: u16,
    /// Bind a conventional-port listener for protocols left unconfigured
    pub allow_default_listeners: bool,
    /// A new control-plane connection starts from an empty endpoint set
    pub reset_on_connect: bool,
    /// Age after which a pending Modbus request is answered with exception 4
    pub request_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub modbus_default_port: u16,
    pub iec61850_default_port: u16,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            control_host: "127.0.0.1".to_string(),
            control_port: 34001,
            allow_default_listeners: false,
            reset_on_connect: false,
            request_timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
            modbus_default_port: 502,
            iec61850_default_port: 102,
        }
    }
}

/// Transport failures; each one affects a single endpoint or connection
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Backend {addr} unreachable: {source}")]
    Backend {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
