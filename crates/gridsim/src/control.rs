//! Control Session Manager
//!
//! Select-before-operate sessions and interlock checks for IEC 61850
//! controllable data objects. Control metadata lives in the data model by
//! path convention:
//!
//! - `${path}.ctlModel`: string (`"sbo-with-enhanced-security"`) or the IEC
//!   integer code 0-4
//! - `${path}.sboTimeout`: selection lifetime in milliseconds
//!
//! Sessions are never swept by a timer; an expired session is discovered
//! and dropped the next time anything looks at it.

use std::collections::HashMap;
use std::fmt;

use gridsim_types::Value;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::datamodel::{DEFAULT_PROFILE, DataModel};

/// Selection lifetime when `${path}.sboTimeout` is absent
pub const DEFAULT_SBO_TIMEOUT_MS: u64 = 30_000;

/// Coil address of the interlock kill switch in the default profile
pub const DEFAULT_KILL_SWITCH_COIL: u16 = 9000;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// The step of a control sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Selection,
    Operation,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::Selection => f.write_str("Selection"),
            ControlAction::Operation => f.write_str("Operation"),
        }
    }
}

/// SBO session failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("Object not selected")]
    NotSelected,

    #[error("Selection expired")]
    SelectionExpired,

    #[error("Selected by another client")]
    ClientMismatch,

    #[error("Locked by another client")]
    LockedByOtherClient,
}

/// Why a control request was refused
///
/// `Display` is the literal reason reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Control Model does not support {0}")]
    ControlModel(ControlAction),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("Blocked by interlock")]
    InterlockBlocked,
}

/// Structured outcome returned to control clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ControlResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl From<Result<(), ControlError>> for ControlResult {
    fn from(result: Result<(), ControlError>) -> Self {
        match result {
            Ok(()) => ControlResult::ok(),
            Err(e) => ControlResult::failed(e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control model
// ─────────────────────────────────────────────────────────────────────────────

/// IEC 61850 control model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlModel {
    StatusOnly,
    DirectNormal,
    SboNormal,
    DirectEnhanced,
    SboEnhanced,
}

impl ControlModel {
    /// Interpret a `ctlModel` attribute
    ///
    /// An absent attribute behaves as direct control with normal security.
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(s)) => {
                let s = s.to_ascii_lowercase();
                match (s.contains("sbo"), s.contains("enhanced")) {
                    (true, true) => ControlModel::SboEnhanced,
                    (true, false) => ControlModel::SboNormal,
                    (false, true) => ControlModel::DirectEnhanced,
                    (false, false) if s.contains("status") => ControlModel::StatusOnly,
                    (false, false) => ControlModel::DirectNormal,
                }
            }
            Some(v) => match v.as_i64() {
                Some(0) => ControlModel::StatusOnly,
                Some(2) => ControlModel::SboNormal,
                Some(3) => ControlModel::DirectEnhanced,
                Some(4) => ControlModel::SboEnhanced,
                _ => ControlModel::DirectNormal,
            },
            None => ControlModel::DirectNormal,
        }
    }

    pub fn is_sbo(self) -> bool {
        matches!(self, ControlModel::SboNormal | ControlModel::SboEnhanced)
    }

    pub fn is_enhanced(self) -> bool {
        matches!(self, ControlModel::DirectEnhanced | ControlModel::SboEnhanced)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interlocking
// ─────────────────────────────────────────────────────────────────────────────

/// Direction a breaker operate would move the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerIntent {
    Open,
    Close,
}

impl BreakerIntent {
    /// `true`/Dbpos 2 closes, `false`/Dbpos 1 opens
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(true) => Some(BreakerIntent::Close),
            Value::Bool(false) => Some(BreakerIntent::Open),
            v => match v.as_i64() {
                Some(2) => Some(BreakerIntent::Close),
                Some(1) => Some(BreakerIntent::Open),
                _ => None,
            },
        }
    }
}

/// Reserved coil that blocks every enhanced-security control when set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitch {
    #[serde(default = "default_kill_switch_profile")]
    pub profile: String,
    #[serde(default = "default_kill_switch_coil")]
    pub coil: u16,
}

fn default_kill_switch_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_kill_switch_coil() -> u16 {
    DEFAULT_KILL_SWITCH_COIL
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self {
            profile: default_kill_switch_profile(),
            coil: default_kill_switch_coil(),
        }
    }
}

/// Interlock rules applied to enhanced-security controls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interlock {
    pub kill_switch: KillSwitch,
}

impl Interlock {
    /// Check whether a control on `path` may proceed
    ///
    /// With no intended value (select) only the kill switch is consulted.
    pub fn check(
        &self,
        model: &DataModel,
        path: &str,
        intent: Option<&Value>,
    ) -> Result<(), ControlError> {
        let killed = model
            .profile(&self.kill_switch.profile)
            .coils
            .get(&self.kill_switch.coil)
            .copied()
            .unwrap_or(false);
        if killed {
            return Err(ControlError::InterlockBlocked);
        }

        let Some(intent) = intent.and_then(BreakerIntent::from_value) else {
            return Ok(());
        };
        let block = match intent {
            BreakerIntent::Open => "BlkOpn",
            BreakerIntent::Close => "BlkCls",
        };
        let blocking = format!("{}.{block}.stVal", parent_path(path));
        if model.read_mms(&blocking).is_some_and(Value::truthy) {
            return Err(ControlError::InterlockBlocked);
        }
        Ok(())
    }
}

/// Trim the last dotted segment (`LD/CSWI1.Pos` → `LD/CSWI1`)
pub fn parent_path(path: &str) -> &str {
    path.rsplit_once('.').map(|(parent, _)| parent).unwrap_or(path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// A live selection
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ControlSession {
    pub path: String,
    pub client: String,
    #[ts(type = "number")]
    pub expires_at: u64,
    pub value: Option<Value>,
}

/// At most one live session per path
#[derive(Debug, Clone, Default)]
pub struct ControlSessions {
    sessions: HashMap<String, ControlSession>,
}

impl ControlSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record a selection
    pub fn select(
        &mut self,
        model: &DataModel,
        interlock: &Interlock,
        path: &str,
        client: &str,
        now_ms: u64,
    ) -> Result<(), ControlError> {
        let ctl = control_model(model, path);
        if !ctl.is_sbo() {
            return Err(ControlError::ControlModel(ControlAction::Selection));
        }

        if let Some(existing) = self.live(path, now_ms) {
            if existing.client != client {
                return Err(SelectionError::LockedByOtherClient.into());
            }
        }

        if ctl.is_enhanced() {
            interlock.check(model, path, None)?;
        }

        let timeout = model
            .read_mms(&format!("{path}.sboTimeout"))
            .and_then(Value::as_i64)
            .filter(|t| *t > 0)
            .map(|t| t as u64)
            .unwrap_or(DEFAULT_SBO_TIMEOUT_MS);

        self.sessions.insert(
            path.to_string(),
            ControlSession {
                path: path.to_string(),
                client: client.to_string(),
                expires_at: now_ms + timeout,
                value: None,
            },
        );
        Ok(())
    }

    /// Validate an operate; the caller performs the write and then [`Self::cancel`]s
    pub fn check_operate(
        &mut self,
        model: &DataModel,
        interlock: &Interlock,
        path: &str,
        value: &Value,
        client: &str,
        now_ms: u64,
    ) -> Result<(), ControlError> {
        let ctl = control_model(model, path);
        if ctl == ControlModel::StatusOnly {
            return Err(ControlError::ControlModel(ControlAction::Operation));
        }

        if ctl.is_sbo() {
            let Some(session) = self.sessions.get(path) else {
                return Err(SelectionError::NotSelected.into());
            };
            if now_ms > session.expires_at {
                self.sessions.remove(path);
                return Err(SelectionError::SelectionExpired.into());
            }
            if session.client != client {
                return Err(SelectionError::ClientMismatch.into());
            }
        }

        if ctl.is_enhanced() {
            interlock.check(model, path, Some(value))?;
        }
        Ok(())
    }

    /// Drop any session on `path`; returns whether one was live
    pub fn cancel(&mut self, path: &str, now_ms: u64) -> bool {
        self.sessions
            .remove(path)
            .is_some_and(|s| now_ms <= s.expires_at)
    }

    /// The unexpired session on `path`, dropping it if it has expired
    pub fn live(&mut self, path: &str, now_ms: u64) -> Option<&ControlSession> {
        if self
            .sessions
            .get(path)
            .is_some_and(|s| now_ms > s.expires_at)
        {
            self.sessions.remove(path);
        }
        self.sessions.get(path)
    }

    /// Every stored session, expired or not
    pub fn sessions(&self) -> impl Iterator<Item = &ControlSession> {
        self.sessions.values()
    }
}

/// Control model of the data object at `path`
pub fn control_model(model: &DataModel, path: &str) -> ControlModel {
    ControlModel::from_value(model.read_mms(&format!("{path}.ctlModel")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSWI: &str = "IED1LD0/CSWI1.Pos";

    fn model(ctl: &str) -> DataModel {
        let mut model = DataModel::new();
        model.write_mms(&format!("{CSWI}.ctlModel"), Value::from(ctl));
        model.write_mms(&format!("{CSWI}.stVal"), Value::Int(1));
        model
    }

    #[test]
    fn test_control_model_parsing() {
        let parse = |v: Value| ControlModel::from_value(Some(&v));
        assert_eq!(parse(Value::from("status-only")), ControlModel::StatusOnly);
        assert_eq!(
            parse(Value::from("direct-with-normal-security")),
            ControlModel::DirectNormal
        );
        assert_eq!(
            parse(Value::from("sbo-with-enhanced-security")),
            ControlModel::SboEnhanced
        );
        assert_eq!(parse(Value::Int(2)), ControlModel::SboNormal);
        assert_eq!(parse(Value::Int(3)), ControlModel::DirectEnhanced);
        assert_eq!(ControlModel::from_value(None), ControlModel::DirectNormal);
    }

    #[test]
    fn test_select_on_status_only_fails() {
        let model = model("status-only");
        let mut sessions = ControlSessions::new();
        let err = sessions
            .select(&model, &Interlock::default(), CSWI, "a", 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "Control Model does not support Selection");
    }

    #[test]
    fn test_select_then_operate_same_client() {
        let model = model("sbo-with-normal-security");
        let interlock = Interlock::default();
        let mut sessions = ControlSessions::new();
        sessions.select(&model, &interlock, CSWI, "a", 1_000).unwrap();
        assert!(
            sessions
                .check_operate(&model, &interlock, CSWI, &Value::Int(2), "a", 2_000)
                .is_ok()
        );
    }

    #[test]
    fn test_operate_without_select_fails() {
        let model = model("sbo-with-normal-security");
        let mut sessions = ControlSessions::new();
        let err = sessions
            .check_operate(&model, &Interlock::default(), CSWI, &Value::Int(2), "a", 0)
            .unwrap_err();
        assert_eq!(err, ControlError::Selection(SelectionError::NotSelected));
        assert_eq!(err.to_string(), "Object not selected");
    }

    #[test]
    fn test_other_client_is_locked_out_until_expiry() {
        let mut model = model("sbo-with-normal-security");
        model.write_mms(&format!("{CSWI}.sboTimeout"), Value::Int(5_000));
        let interlock = Interlock::default();
        let mut sessions = ControlSessions::new();

        sessions.select(&model, &interlock, CSWI, "a", 0).unwrap();
        assert_eq!(
            sessions.select(&model, &interlock, CSWI, "b", 1_000),
            Err(SelectionError::LockedByOtherClient.into())
        );
        assert_eq!(
            sessions.check_operate(&model, &interlock, CSWI, &Value::Int(2), "b", 1_000),
            Err(SelectionError::ClientMismatch.into())
        );
        assert_eq!(
            sessions.check_operate(&model, &interlock, CSWI, &Value::Int(2), "a", 5_001),
            Err(SelectionError::SelectionExpired.into())
        );
        assert!(sessions.select(&model, &interlock, CSWI, "b", 5_002).is_ok());
    }

    #[test]
    fn test_interlock_blocks_by_direction() {
        let mut model = model("direct-with-enhanced-security");
        model.write_mms("IED1LD0/CSWI1.BlkCls.stVal", Value::Bool(true));
        let interlock = Interlock::default();
        let mut sessions = ControlSessions::new();

        assert_eq!(
            sessions.check_operate(&model, &interlock, CSWI, &Value::Bool(true), "a", 0),
            Err(ControlError::InterlockBlocked)
        );
        assert!(
            sessions
                .check_operate(&model, &interlock, CSWI, &Value::Bool(false), "a", 0)
                .is_ok()
        );
    }

    #[test]
    fn test_kill_switch_blocks_enhanced_only() {
        let mut model = model("sbo-with-enhanced-security");
        model
            .profile_mut(DEFAULT_PROFILE)
            .coils
            .insert(DEFAULT_KILL_SWITCH_COIL, true);
        let interlock = Interlock::default();
        let mut sessions = ControlSessions::new();
        assert_eq!(
            sessions.select(&model, &interlock, CSWI, "a", 0),
            Err(ControlError::InterlockBlocked)
        );

        model.write_mms(
            &format!("{CSWI}.ctlModel"),
            Value::from("sbo-with-normal-security"),
        );
        assert!(sessions.select(&model, &interlock, CSWI, "a", 0).is_ok());
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("LD0/XCBR1.Pos"), "LD0/XCBR1");
        assert_eq!(parent_path("plain"), "plain");
    }
}
