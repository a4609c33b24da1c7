//! Script Scheduler / Debugger
//!
//! Cooperative, single-threaded execution of every virtual device's program
//! on one periodic tick, with breakpoints and single-stepping.
//!
//! ```text
//! tick ─┬─ environments (noise, ...)
//!       ├─ GOOSE scheduler
//!       └─ for each enabled, due device:
//!            step ──▶ Suspended(line) ──▶ history, breakpoints, step mode
//!                 └─▶ Completed        ──▶ cycle done, restart next due tick
//! ```

mod context;
mod debug;
mod environment;
mod program;
mod scheduler;

pub use context::*;
pub use debug::*;
pub use environment::*;
pub use program::*;
pub use scheduler::*;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use st_runtime::CompileError;

/// Engine handle shared by the tick loop, the relay bridge and the watcher
pub type SharedEngine = Arc<parking_lot::Mutex<Engine>>;

/// Tunables of the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Period of the engine tick
    pub tick_period_ms: u64,
    /// Statements one device may run per tick before yielding
    pub statement_budget: usize,
    /// Bound of each device's execution history
    pub history_capacity: usize,
    /// Cycle period of devices that do not configure one
    pub default_tick_rate_ms: u64,
    /// Seed for environment noise; random when unset
    pub noise_seed: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            statement_budget: 10_000,
            history_capacity: 500,
            default_tick_rate_ms: 100,
            noise_seed: None,
        }
    }
}

/// Errors from engine management calls
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device {device}: {error}")]
    Compile {
        device: String,
        error: CompileError,
    },

    #[error("Invalid engine state: {0}")]
    InvalidState(&'static str),
}

pub type EngineResult<T> = Result<T, EngineError>;
