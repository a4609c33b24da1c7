//! Device context
//!
//! The `Device.*` surface handed to a running program. Register calls go to
//! the device's profile; data-attribute calls go through the substation so
//! GOOSE sees script writes.

use std::collections::VecDeque;

use chrono::Utc;
use gridsim_types::Value;
use st_runtime::{DeviceApi, LogLevel};
use tracing::{debug, error, info, warn};

use super::program::{LogEntry, push_log};
use crate::substation::{Substation, WriteSource};

/// `DeviceApi` implementation backed by the live substation
pub struct DeviceContext<'a> {
    pub device_id: &'a str,
    pub profile: &'a str,
    pub substation: &'a mut Substation,
    pub logs: &'a mut VecDeque<LogEntry>,
    pub now_ms: u64,
}

impl DeviceApi for DeviceContext<'_> {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn read_input(&mut self, address: u16) -> bool {
        self.substation
            .model()
            .profile(self.profile)
            .discrete_inputs
            .get(&address)
            .copied()
            .unwrap_or(false)
    }

    fn read_register(&mut self, address: u16) -> u16 {
        let profile = self.substation.model().profile(self.profile);
        profile
            .holding_registers
            .get(&address)
            .or_else(|| profile.input_registers.get(&address))
            .copied()
            .unwrap_or(0)
    }

    fn write_coil(&mut self, address: u16, value: bool) {
        self.substation
            .model_mut()
            .profile_mut(self.profile)
            .coils
            .insert(address, value);
    }

    fn write_register(&mut self, address: u16, value: u16) {
        self.substation
            .model_mut()
            .profile_mut(self.profile)
            .holding_registers
            .insert(address, value);
    }

    fn get_da(&mut self, path: &str) -> Value {
        self.substation.read_mms(path).cloned().unwrap_or_default()
    }

    fn set_da(&mut self, path: &str, value: Value) {
        self.substation
            .write_mms(path, value, WriteSource::Script(self.device_id), self.now_ms);
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        let device_id = self.device_id;
        match level {
            LogLevel::Debug => debug!(target: "gridsim::script", device_id, "{message}"),
            LogLevel::Info => info!(target: "gridsim::script", device_id, "{message}"),
            LogLevel::Warn => warn!(target: "gridsim::script", device_id, "{message}"),
            LogLevel::Error => error!(target: "gridsim::script", device_id, "{message}"),
        }
        push_log(
            self.logs,
            LogEntry {
                timestamp: Utc::now(),
                level,
                message: message.to_string(),
            },
        );
    }
}
