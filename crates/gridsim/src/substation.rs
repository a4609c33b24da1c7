//! Substation
//!
//! The data model together with the behaviour attached to it: control
//! sessions, interlocking, GOOSE change notification and breaker mirroring.
//! Every MMS write that should be visible to GOOSE goes through
//! [`Substation::write_mms`].

use gridsim_types::Value;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::control::{ControlResult, ControlSessions, Interlock};
use crate::datamodel::{DEFAULT_PROFILE, DataModel};
use crate::goose::{GooseConfig, GooseFrame, GooseScheduler};
use crate::modbus::{Request, Response};

/// Links a breaker position object to the coils that mirror it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerBinding {
    /// Data object path, e.g. `IED1LD0/XCBR1.Pos`
    pub path: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    pub coil: u16,
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

/// Who caused an MMS write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource<'a> {
    Script(&'a str),
    Control(&'a str),
    Environment,
    Project,
}

/// A successful operate, waiting to be published as `CONTROL_UPDATE`
#[derive(Debug, Clone, PartialEq)]
pub struct ControlUpdate {
    pub path: String,
    pub client: String,
    pub value: Value,
    pub at_ms: u64,
}

/// Data model plus control, interlock and GOOSE behaviour
#[derive(Debug, Clone, Default)]
pub struct Substation {
    model: DataModel,
    controls: ControlSessions,
    goose: GooseScheduler,
    interlock: Interlock,
    breaker_bindings: Vec<BreakerBinding>,
    control_updates: Vec<ControlUpdate>,
}

impl Substation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self) -> &DataModel {
        &self.model
    }

    /// Direct access for Modbus tables; MMS writes should use [`Self::write_mms`]
    pub fn model_mut(&mut self) -> &mut DataModel {
        &mut self.model
    }

    pub fn goose(&self) -> &GooseScheduler {
        &self.goose
    }

    pub fn controls(&self) -> &ControlSessions {
        &self.controls
    }

    pub fn set_interlock(&mut self, interlock: Interlock) {
        self.interlock = interlock;
    }

    pub fn set_breaker_bindings(&mut self, bindings: Vec<BreakerBinding>) {
        self.breaker_bindings = bindings;
    }

    // ─────────────────────────────────────────────────────────────────────
    // MMS
    // ─────────────────────────────────────────────────────────────────────

    pub fn read_mms(&self, path: &str) -> Option<&Value> {
        self.model.read_mms(path)
    }

    /// Upsert an attribute and notify GOOSE if it changed
    pub fn write_mms(
        &mut self,
        path: &str,
        value: Value,
        source: WriteSource<'_>,
        now_ms: u64,
    ) -> bool {
        let changed = self.model.write_mms(path, value.clone());
        if changed {
            debug!(path, %value, ?source, "attribute changed");
            self.goose.on_data_change(path, &value, now_ms);
        }
        changed
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────

    pub fn select_control(&mut self, path: &str, client: &str, now_ms: u64) -> ControlResult {
        let result = self
            .controls
            .select(&self.model, &self.interlock, path, client, now_ms);
        debug!(path, client, ?result, "select");
        result.into()
    }

    /// Operate a control object
    ///
    /// On success writes `${path}.stVal`, stamps `${path}.t` when present,
    /// clears the selection and mirrors breaker positions into bound coils.
    pub fn operate_control(
        &mut self,
        path: &str,
        value: Value,
        client: &str,
        now_ms: u64,
    ) -> ControlResult {
        if let Err(e) = self.controls.check_operate(
            &self.model,
            &self.interlock,
            path,
            &value,
            client,
            now_ms,
        ) {
            debug!(path, client, error = %e, "operate refused");
            return ControlResult::failed(e);
        }

        self.write_mms(
            &format!("{path}.stVal"),
            value.clone(),
            WriteSource::Control(client),
            now_ms,
        );
        let stamp = format!("{path}.t");
        if self.model.read_mms(&stamp).is_some() {
            self.write_mms(&stamp, Value::from(now_ms), WriteSource::Control(client), now_ms);
        }
        self.controls.cancel(path, now_ms);

        if is_breaker_position(path) {
            if let Some(closed) = breaker_closed(&value) {
                self.mirror_breaker(path, closed);
            }
        }

        info!(target: "gridsim::control", path, client, %value, "CONTROL_UPDATE");
        self.control_updates.push(ControlUpdate {
            path: path.to_string(),
            client: client.to_string(),
            value,
            at_ms: now_ms,
        });
        ControlResult::ok()
    }

    /// Operates recorded since the last call, oldest first
    pub fn take_control_updates(&mut self) -> Vec<ControlUpdate> {
        std::mem::take(&mut self.control_updates)
    }

    pub fn cancel_control(&mut self, path: &str, now_ms: u64) -> ControlResult {
        self.controls.cancel(path, now_ms);
        ControlResult::ok()
    }

    fn mirror_breaker(&mut self, path: &str, closed: bool) {
        for binding in self.breaker_bindings.iter().filter(|b| b.path == path) {
            self.model
                .profile_mut(&binding.profile)
                .coils
                .insert(binding.coil, closed);
            debug!(path, profile = %binding.profile, coil = binding.coil, closed, "breaker mirrored");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // GOOSE
    // ─────────────────────────────────────────────────────────────────────

    pub fn register_goose(
        &mut self,
        path: &str,
        config: GooseConfig,
        dataset: Vec<String>,
        now_ms: u64,
    ) {
        self.goose
            .register(path, config, dataset, &self.model, now_ms);
    }

    pub fn unregister_goose(&mut self, path: &str) -> bool {
        self.goose.unregister(path)
    }

    pub fn set_goose_enabled(&mut self, path: &str, enabled: bool) -> bool {
        self.goose.set_enabled(path, enabled)
    }

    pub fn update_goose_config(&mut self, path: &str, config: GooseConfig, now_ms: u64) -> bool {
        self.goose.update_config(path, config, now_ms)
    }

    pub fn update_goose_dataset(&mut self, path: &str, dataset: Vec<String>, now_ms: u64) -> bool {
        self.goose
            .update_dataset(path, dataset, &self.model, now_ms)
    }

    pub fn tick_goose(&mut self, now_ms: u64) -> Vec<GooseFrame> {
        self.goose.tick(now_ms)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Modbus
    // ─────────────────────────────────────────────────────────────────────

    pub fn handle_modbus(&mut self, unit_id: u8, request: &Request) -> Response {
        self.model.handle_modbus(unit_id, request)
    }
}

/// `…/XCBRn.Pos` or `…/CSWIn.Pos`
pub fn is_breaker_position(path: &str) -> bool {
    let Some((parent, last)) = path.rsplit_once('.') else {
        return false;
    };
    if last != "Pos" {
        return false;
    }
    let ln = parent.rsplit_once('/').map(|(_, ln)| ln).unwrap_or(parent);
    let ln = ln.rsplit('.').next().unwrap_or(ln);
    ln.starts_with("XCBR") || ln.starts_with("CSWI")
}

/// Closed state carried by a breaker position value
pub fn breaker_closed(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        v => match v.as_i64() {
            Some(2) => Some(true),
            Some(1) => Some(false),
            Some(n) => Some(n != 0),
            None => v.as_f64().map(|f| f != 0.0),
        },
    }
}
