//! The engine instance
//!
//! Owns the substation, the device registry and the environments, and
//! drives all of them from [`Engine::tick`]. Nothing here is shared across
//! threads; callers wrap the engine in a mutex when they need to.

use std::collections::BTreeMap;
use std::sync::Arc;

use gridsim_types::{Clock, SystemClock};
use serde::Serialize;
use st_runtime::{Execution, RuntimeError, StepOutcome};
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use super::context::DeviceContext;
use super::debug::DebugState;
use super::environment::Environment;
use super::program::{DeviceConfig, DeviceRuntime};
use super::{EngineError, EngineResult, EngineSettings};
use crate::goose::GooseFrame;
use crate::substation::{ControlUpdate, Substation};

/// Global run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Running,
    Paused,
}

/// Where a tick stopped for the debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PausePoint {
    pub device_id: String,
    pub line: u32,
}

/// What happened during one tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub frames: Vec<GooseFrame>,
    /// Operates since the previous tick
    pub control_updates: Vec<ControlUpdate>,
    pub paused_at: Option<PausePoint>,
    pub error: Option<String>,
}

enum RunOutcome {
    Idle,
    /// Budget ran out mid-cycle
    Yielded,
    Completed,
    Paused(u32),
}

/// One independent simulation
pub struct Engine {
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    substation: Substation,
    devices: BTreeMap<String, DeviceRuntime>,
    environments: Vec<Box<dyn Environment>>,
    state: EngineState,
    debug_target: Option<String>,
    /// A `step_over` is waiting for the target's next suspension
    step_pending: bool,
    last_error: Option<String>,
}

impl Engine {
    pub fn new(settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            substation: Substation::new(),
            devices: BTreeMap::new(),
            environments: Vec::new(),
            state: EngineState::Stopped,
            debug_target: None,
            step_pending: false,
            last_error: None,
        }
    }

    /// Engine on wall-clock time
    pub fn with_system_clock(settings: EngineSettings) -> Self {
        Self::new(settings, Arc::new(SystemClock))
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn substation(&self) -> &Substation {
        &self.substation
    }

    pub fn substation_mut(&mut self) -> &mut Substation {
        &mut self.substation
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The runtime error that last stopped the engine
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn add_environment(&mut self, environment: Box<dyn Environment>) {
        debug!(environment = environment.name(), "Environment added");
        self.environments.push(environment);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Run state
    // ─────────────────────────────────────────────────────────────────────

    pub fn start(&mut self) {
        if self.state == EngineState::Stopped {
            self.reset_executions();
        }
        self.state = EngineState::Running;
        self.step_pending = false;
        self.last_error = None;
        info!(devices = self.devices.len(), "Engine started");
    }

    pub fn stop(&mut self) {
        self.state = EngineState::Stopped;
        self.step_pending = false;
        self.reset_executions();
        info!("Engine stopped");
    }

    pub fn pause(&mut self) -> EngineResult<()> {
        match self.state {
            EngineState::Running => {
                self.state = EngineState::Paused;
                self.step_pending = false;
                info!("Engine paused");
                Ok(())
            }
            EngineState::Paused => Ok(()),
            EngineState::Stopped => Err(EngineError::InvalidState("engine is not running")),
        }
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        match self.state {
            EngineState::Paused => {
                self.state = EngineState::Running;
                self.step_pending = false;
                info!("Engine resumed");
                Ok(())
            }
            EngineState::Running => Ok(()),
            EngineState::Stopped => Err(EngineError::InvalidState("engine is not running")),
        }
    }

    /// Advance the debug target by one suspension point, then pause again
    pub fn step_over(&mut self) -> EngineResult<()> {
        if self.state != EngineState::Paused {
            return Err(EngineError::InvalidState("engine is not paused"));
        }
        let Some(target) = self.debug_target.as_deref() else {
            return Err(EngineError::InvalidState("no debug target"));
        };
        let runnable = self
            .devices
            .get(target)
            .is_some_and(|device| device.enabled && device.program().is_some());
        if !runnable {
            return Err(EngineError::InvalidState("debug target cannot run"));
        }
        self.state = EngineState::Running;
        self.step_pending = true;
        Ok(())
    }

    /// Drop a pending step whose target went away; the engine stays paused
    fn cancel_step(&mut self) {
        if self.step_pending {
            self.step_pending = false;
            self.state = EngineState::Paused;
        }
    }

    fn reset_executions(&mut self) {
        for device in self.devices.values_mut() {
            device.reset_execution();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────

    /// Register a device, replacing any device with the same id
    pub fn add_device(&mut self, config: DeviceConfig) {
        info!(device_id = %config.id, profile = %config.profile, "Device added");
        let device = DeviceRuntime::new(
            config,
            self.settings.default_tick_rate_ms,
            self.settings.history_capacity,
        );
        if self.debug_target.as_deref() == Some(device.id.as_str()) {
            self.cancel_step();
        }
        self.devices.insert(device.id.clone(), device);
    }

    pub fn remove_device(&mut self, id: &str) -> EngineResult<()> {
        self.devices
            .remove(id)
            .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))?;
        if self.debug_target.as_deref() == Some(id) {
            self.cancel_step();
            self.debug_target = None;
        }
        info!(device_id = id, "Device removed");
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&DeviceRuntime> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRuntime> {
        self.devices.values()
    }

    fn device_mut(&mut self, id: &str) -> EngineResult<&mut DeviceRuntime> {
        self.devices
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))
    }

    /// Disabling drops the device's in-flight cycle and nothing else
    pub fn set_device_enabled(&mut self, id: &str, enabled: bool) -> EngineResult<()> {
        let device = self.device_mut(id)?;
        device.enabled = enabled;
        if !enabled {
            device.reset_execution();
            if self.debug_target.as_deref() == Some(id) {
                self.cancel_step();
            }
        }
        debug!(device_id = id, enabled, "Device enabled changed");
        Ok(())
    }

    pub fn set_tick_rate(&mut self, id: &str, tick_rate_ms: u64) -> EngineResult<()> {
        self.device_mut(id)?.tick_rate_ms = tick_rate_ms;
        Ok(())
    }

    /// Compile and install a device's script
    pub fn load_script(&mut self, id: &str, source: &str) -> EngineResult<()> {
        let now = self.now_ms();
        let device = self.device_mut(id)?;
        match device.load(source, now) {
            Ok(()) => {
                info!(device_id = id, "Script loaded");
                Ok(())
            }
            Err(error) => {
                warn!(device_id = id, %error, "Script rejected, keeping previous program");
                Err(EngineError::Compile {
                    device: id.to_string(),
                    error,
                })
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Breakpoints & debug target
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_breakpoint(
        &mut self,
        id: &str,
        line: u32,
        enabled: bool,
        condition: Option<String>,
        hit_count: Option<u32>,
    ) -> EngineResult<()> {
        self.device_mut(id)?
            .set_breakpoint(line, enabled, condition, hit_count);
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, id: &str, line: u32) -> EngineResult<bool> {
        Ok(self.device_mut(id)?.breakpoints.remove(&line).is_some())
    }

    pub fn clear_breakpoints(&mut self, id: &str) -> EngineResult<()> {
        self.device_mut(id)?.breakpoints.clear();
        Ok(())
    }

    pub fn set_debug_target(&mut self, id: Option<&str>) -> EngineResult<()> {
        if let Some(id) = id {
            self.device_mut(id)?;
        }
        self.debug_target = id.map(str::to_string);
        self.step_pending = false;
        Ok(())
    }

    pub fn debug_target(&self) -> Option<&str> {
        self.debug_target.as_deref()
    }

    /// Inspection of the debug target
    pub fn debug_state(&self) -> Option<DebugState> {
        let device = self.devices.get(self.debug_target.as_deref()?)?;
        Some(DebugState::capture(
            device,
            self.state == EngineState::Running,
            self.state == EngineState::Paused,
            self.now_ms(),
        ))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────

    /// Run one scheduler period
    pub fn tick(&mut self) -> TickReport {
        let now = self.now_ms();

        for environment in &mut self.environments {
            environment.apply(&mut self.substation, now);
        }

        let frames = self.substation.tick_goose(now);
        for frame in &frames {
            debug!(
                go_cb_ref = %frame.go_cb_ref,
                st_num = frame.st_num,
                sq_num = frame.sq_num,
                tal = frame.time_allowed_to_live,
                "GOOSE frame"
            );
        }
        let mut report = TickReport {
            frames,
            control_updates: self.substation.take_control_updates(),
            ..Default::default()
        };

        if self.state != EngineState::Running {
            return report;
        }

        let ids: Vec<String> = self.devices.keys().cloned().collect();
        for id in ids {
            let step_target = self.step_pending && self.debug_target.as_deref() == Some(&id);
            let Some(device) = self.devices.get_mut(&id) else {
                continue;
            };
            if !device.enabled || !(device.is_due(now) || step_target) {
                continue;
            }

            match run_device(
                device,
                &mut self.substation,
                self.settings.statement_budget,
                step_target,
                now,
            ) {
                Ok(RunOutcome::Paused(line)) => {
                    self.state = EngineState::Paused;
                    self.step_pending = false;
                    self.debug_target = Some(id.clone());
                    info!(device_id = %id, line, "Execution paused");
                    report.paused_at = Some(PausePoint { device_id: id, line });
                    break;
                }
                Ok(RunOutcome::Completed) => {
                    debug!(device_id = %id, "Cycle complete");
                }
                Ok(RunOutcome::Idle | RunOutcome::Yielded) => {}
                Err(e) => {
                    let message = format!("{id}: {e}");
                    error!(device_id = %id, error = %e, "Script runtime error, engine stopped");
                    self.stop();
                    self.last_error = Some(message.clone());
                    report.error = Some(message);
                    break;
                }
            }
        }
        report
    }
}

/// Advance one device until it completes, pauses or exhausts the budget
fn run_device(
    device: &mut DeviceRuntime,
    substation: &mut Substation,
    budget: usize,
    step_target: bool,
    now: u64,
) -> Result<RunOutcome, RuntimeError> {
    let Some(program) = device.program.as_ref() else {
        return Ok(RunOutcome::Idle);
    };
    let mut execution = device
        .execution
        .take()
        .unwrap_or_else(|| Execution::new(program));
    let Some(mut scope) = device.scope.take() else {
        return Ok(RunOutcome::Idle);
    };

    let mut outcome = Ok(RunOutcome::Yielded);
    for _ in 0..budget {
        let step = {
            let mut ctx = DeviceContext {
                device_id: &device.id,
                profile: &device.profile,
                substation: &mut *substation,
                logs: &mut device.logs,
                now_ms: now,
            };
            execution.step(&mut scope, &mut ctx)
        };
        match step {
            Ok(StepOutcome::Suspended(line)) => {
                device.record_line(line);
                let hit = device
                    .breakpoints
                    .get_mut(&line)
                    .is_some_and(|bp| bp.hit(&scope, now));
                if hit || step_target {
                    outcome = Ok(RunOutcome::Paused(line));
                    break;
                }
            }
            Ok(StepOutcome::Completed) => {
                outcome = Ok(RunOutcome::Completed);
                break;
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    device.scope = Some(scope);
    match outcome {
        Ok(RunOutcome::Completed) => {
            device.execution = None;
            device.last_cycle_at = Some(now);
        }
        Ok(_) => device.execution = Some(execution),
        Err(_) => device.execution = None,
    }
    outcome
}

#[cfg(test)]
mod tests {
    use gridsim_types::{ManualClock, Value};

    use super::*;

    const COUNTER: &str = "\
VAR n : INT := 0; END_VAR
n := n + 1;
Device.WriteRegister(1, n);";

    fn engine() -> (Engine, ManualClock) {
        let clock = ManualClock::new(0);
        let engine = Engine::new(EngineSettings::default(), Arc::new(clock.clone()));
        (engine, clock)
    }

    #[test]
    fn test_stopped_engine_runs_no_scripts() {
        let (mut engine, _clock) = engine();
        engine.add_device(DeviceConfig::new("a"));
        engine.load_script("a", COUNTER).unwrap();
        engine.tick();
        assert_eq!(engine.device("a").unwrap().current_line(), None);
    }

    #[test]
    fn test_device_runs_once_per_tick_rate() {
        let (mut engine, clock) = engine();
        engine.add_device(DeviceConfig {
            tick_rate_ms: Some(500),
            ..DeviceConfig::new("a")
        });
        engine.load_script("a", COUNTER).unwrap();
        engine.start();

        for _ in 0..10 {
            engine.tick();
            clock.advance(100);
        }
        let scope = engine.device("a").unwrap().scope().unwrap();
        assert_eq!(scope.lookup("n"), Some(&Value::Int(2)));
        assert_eq!(
            engine
                .substation()
                .model()
                .profile("default")
                .holding_registers
                .get(&1),
            Some(&2)
        );
    }

    #[test]
    fn test_step_over_advances_one_line() {
        let (mut engine, _clock) = engine();
        engine.add_device(DeviceConfig::new("a"));
        engine.load_script("a", COUNTER).unwrap();
        engine.set_breakpoint("a", 2, true, None, None).unwrap();
        engine.start();

        let report = engine.tick();
        assert_eq!(
            report.paused_at,
            Some(PausePoint {
                device_id: "a".into(),
                line: 2
            })
        );
        assert_eq!(engine.state(), EngineState::Paused);

        // Paused ticks do not run scripts
        engine.tick();
        assert_eq!(engine.device("a").unwrap().current_line(), Some(2));

        engine.step_over().unwrap();
        let report = engine.tick();
        assert_eq!(report.paused_at.map(|p| p.line), Some(3));
        assert_eq!(engine.state(), EngineState::Paused);

        let debug = engine.debug_state().unwrap();
        assert!(debug.paused);
        assert_eq!(debug.history, vec![2, 3]);
        assert_eq!(debug.breakpoints[0].hits, 1);
    }

    #[test]
    fn test_step_over_requires_a_runnable_target() {
        let (mut engine, _clock) = engine();
        engine.add_device(DeviceConfig::new("a"));
        engine.load_script("a", COUNTER).unwrap();
        engine.set_breakpoint("a", 2, true, None, None).unwrap();
        engine.start();
        assert!(engine.tick().paused_at.is_some());

        engine.set_device_enabled("a", false).unwrap();
        assert!(matches!(
            engine.step_over(),
            Err(EngineError::InvalidState("debug target cannot run"))
        ));
        assert_eq!(engine.state(), EngineState::Paused);

        // A script-less replacement cannot be stepped either
        engine.add_device(DeviceConfig::new("a"));
        assert!(engine.step_over().is_err());
        assert_eq!(engine.state(), EngineState::Paused);
    }

    #[test]
    fn test_disabling_target_cancels_pending_step() {
        let (mut engine, _clock) = engine();
        engine.add_device(DeviceConfig::new("a"));
        engine.load_script("a", COUNTER).unwrap();
        engine.set_breakpoint("a", 2, true, None, None).unwrap();
        engine.start();
        engine.tick();

        engine.step_over().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.set_device_enabled("a", false).unwrap();
        assert_eq!(engine.state(), EngineState::Paused);

        // Nothing is left pending once the target is enabled again
        engine.set_device_enabled("a", true).unwrap();
        engine.tick();
        assert_eq!(engine.device("a").unwrap().current_line(), None);
        assert_eq!(engine.state(), EngineState::Paused);
    }

    #[test]
    fn test_runtime_error_stops_whole_engine() {
        let (mut engine, _clock) = engine();
        engine.add_device(DeviceConfig::new("a"));
        engine.add_device(DeviceConfig::new("b"));
        engine
            .load_script("a", "VAR x : INT := 0; END_VAR\nx := 1 / x;")
            .unwrap();
        engine.load_script("b", COUNTER).unwrap();
        engine.start();

        let report = engine.tick();
        assert!(report.error.unwrap().starts_with("a: "));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.last_error().is_some());
        // Device "b" comes after "a" and never ran
        assert_eq!(engine.device("b").unwrap().current_line(), None);

        engine.start();
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn test_pause_requires_running_engine() {
        let (mut engine, _clock) = engine();
        assert!(matches!(engine.pause(), Err(EngineError::InvalidState(_))));
        assert!(matches!(engine.step_over(), Err(EngineError::InvalidState(_))));
        assert!(matches!(
            engine.load_script("missing", ""),
            Err(EngineError::UnknownDevice(_))
        ));
    }
}
