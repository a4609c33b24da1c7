//! Device context consumed by compiled programs
//!
//! The interpreter never touches the data model directly; every `Device.*`
//! call goes through this trait. Calls are synchronous and must not block.

use std::fmt;

use gridsim_types::Value;
use serde::{Deserialize, Serialize};

/// Severity passed to `Device.Log`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a script-supplied level; anything unrecognised is `Info`
    pub fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "err" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// The fixed device-scripting surface
pub trait DeviceApi {
    /// Current time in milliseconds (drives `stepTime`)
    fn now_ms(&self) -> u64;

    /// `Device.ReadInput(addr)`
    fn read_input(&mut self, address: u16) -> bool;

    /// `Device.ReadRegister(addr)`
    fn read_register(&mut self, address: u16) -> u16;

    /// `Device.WriteCoil(addr, value)`
    fn write_coil(&mut self, address: u16, value: bool);

    /// `Device.WriteRegister(addr, value)`
    fn write_register(&mut self, address: u16, value: u16);

    /// `Device.GetDA(path)`; `Value::Null` when absent
    fn get_da(&mut self, path: &str) -> Value;

    /// `Device.SetDA(path, value)`
    fn set_da(&mut self, path: &str, value: Value);

    /// `Device.Log(level, message)`
    fn log(&mut self, level: LogLevel, message: &str);
}

/// A device context with no device behind it
///
/// Used for variable initializers and breakpoint conditions, which are
/// rejected at compile time if they call into `Device.*`.
#[derive(Debug, Clone, Copy)]
pub struct Detached {
    pub now_ms: u64,
}

impl DeviceApi for Detached {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn read_input(&mut self, _address: u16) -> bool {
        false
    }

    fn read_register(&mut self, _address: u16) -> u16 {
        0
    }

    fn write_coil(&mut self, _address: u16, _value: bool) {}

    fn write_register(&mut self, _address: u16, _value: u16) {}

    fn get_da(&mut self, _path: &str) -> Value {
        Value::Null
    }

    fn set_da(&mut self, _path: &str, _value: Value) {}

    fn log(&mut self, _level: LogLevel, _message: &str) {}
}
