//! Per-device script state
//!
//! A [`DeviceRuntime`] is everything the scheduler keeps for one virtual
//! device: the compiled program and its scope, the in-flight execution,
//! breakpoints and the bounded histories shown by the debugger.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use st_runtime::{
    CompileError, Detached, Execution, Expr, LogLevel, Program, Scope, compile, compile_condition,
    evaluate,
};
use tracing::warn;
use ts_rs::TS;

use crate::datamodel::DEFAULT_PROFILE;

/// Bound of the per-device log ring
pub const LOG_CAPACITY: usize = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Breakpoints
// ─────────────────────────────────────────────────────────────────────────────

/// A line breakpoint
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub line: u32,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Pause only once `hits` reaches this count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_count: Option<u32>,
    /// Every reach of the line, paused or not
    pub hits: u32,
    #[serde(skip)]
    #[ts(skip)]
    compiled: Option<Expr>,
}

impl Breakpoint {
    pub fn new(line: u32) -> Self {
        Self {
            line,
            enabled: true,
            condition: None,
            hit_count: None,
            hits: 0,
            compiled: None,
        }
    }

    /// Count a reach and decide whether execution should pause
    ///
    /// Condition errors, and conditions that did not compile, count as false.
    pub fn hit(&mut self, scope: &Scope, now_ms: u64) -> bool {
        self.hits = self.hits.saturating_add(1);
        if !self.enabled {
            return false;
        }
        let condition_holds = match (&self.condition, &self.compiled) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(_), Some(expr)) => matches!(
                evaluate(expr, scope, &mut Detached { now_ms }),
                Ok(gridsim_types::Value::Bool(true))
            ),
        };
        condition_holds && self.hit_count.is_none_or(|n| self.hits >= n)
    }

    fn recompile(&mut self, program: Option<&Program>) {
        self.compiled = match (&self.condition, program) {
            (Some(text), Some(program)) => match compile_condition(program, text) {
                Ok(expr) => Some(expr),
                Err(e) => {
                    warn!(line = self.line, condition = %text, error = %e, "Breakpoint condition rejected");
                    None
                }
            },
            _ => None,
        };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logs
// ─────────────────────────────────────────────────────────────────────────────

/// One `Device.Log` record
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[ts(type = "string")]
    pub level: LogLevel,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Device configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a device as loaded from a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Profile the device's `Device.*` register calls address
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Cycle period; the engine default when unset
    #[serde(default)]
    pub tick_rate_ms: Option<u64>,
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_enabled() -> bool {
    true
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            profile: default_profile(),
            enabled: true,
            tick_rate_ms: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceRuntime
// ─────────────────────────────────────────────────────────────────────────────

/// Script state of one device
#[derive(Debug, Clone)]
pub struct DeviceRuntime {
    pub id: String,
    pub name: Option<String>,
    pub profile: String,
    pub enabled: bool,
    pub tick_rate_ms: u64,
    pub(crate) program: Option<Program>,
    pub(crate) scope: Option<Scope>,
    pub(crate) execution: Option<Execution>,
    pub(crate) breakpoints: BTreeMap<u32, Breakpoint>,
    pub(crate) current_line: Option<u32>,
    pub(crate) history: VecDeque<u32>,
    history_capacity: usize,
    pub(crate) logs: VecDeque<LogEntry>,
    /// When the last full cycle completed
    pub(crate) last_cycle_at: Option<u64>,
}

impl DeviceRuntime {
    pub fn new(config: DeviceConfig, default_tick_rate_ms: u64, history_capacity: usize) -> Self {
        Self {
            id: config.id,
            name: config.name,
            profile: config.profile,
            enabled: config.enabled,
            tick_rate_ms: config.tick_rate_ms.unwrap_or(default_tick_rate_ms),
            program: None,
            scope: None,
            execution: None,
            breakpoints: BTreeMap::new(),
            current_line: None,
            history: VecDeque::new(),
            history_capacity,
            logs: VecDeque::new(),
            last_cycle_at: None,
        }
    }

    /// Compile and install a new program
    ///
    /// All-or-nothing: on failure the previous program keeps running.
    pub fn load(&mut self, source: &str, now_ms: u64) -> Result<(), CompileError> {
        let program = compile(source)?;
        let scope = Scope::new(&program, now_ms).map_err(|e| CompileError {
            message: e.message,
            line: e.line,
        })?;

        for breakpoint in self.breakpoints.values_mut() {
            breakpoint.recompile(Some(&program));
        }
        self.program = Some(program);
        self.scope = Some(scope);
        self.reset_execution();
        self.history.clear();
        Ok(())
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn current_line(&self) -> Option<u32> {
        self.current_line
    }

    /// Whether a cycle is in progress
    pub fn is_executing(&self) -> bool {
        self.execution.is_some()
    }

    pub fn history(&self) -> impl Iterator<Item = u32> + '_ {
        self.history.iter().copied()
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// Drop any in-flight cycle
    pub fn reset_execution(&mut self) {
        self.execution = None;
        self.current_line = None;
    }

    /// Due for a new cycle (or already mid-cycle)
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.execution.is_some()
            || self
                .last_cycle_at
                .is_none_or(|at| now_ms.saturating_sub(at) >= self.tick_rate_ms)
    }

    /// Record a suspension point
    pub(crate) fn record_line(&mut self, line: u32) {
        self.current_line = Some(line);
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(line);
    }

    pub(crate) fn set_breakpoint(
        &mut self,
        line: u32,
        enabled: bool,
        condition: Option<String>,
        hit_count: Option<u32>,
    ) {
        let hits = self.breakpoints.get(&line).map(|b| b.hits).unwrap_or(0);
        let mut breakpoint = Breakpoint {
            enabled,
            condition: condition.filter(|c| !c.trim().is_empty()),
            hit_count,
            hits,
            ..Breakpoint::new(line)
        };
        breakpoint.recompile(self.program.as_ref());
        self.breakpoints.insert(line, breakpoint);
    }
}

/// Push into a bounded ring
pub(crate) fn push_log(logs: &mut VecDeque<LogEntry>, entry: LogEntry) {
    if logs.len() >= LOG_CAPACITY {
        logs.pop_front();
    }
    logs.push_back(entry);
}
