//! Debug inspection
//!
//! Snapshot of the debug target's state, plus a textual approximation of
//! the call stack.

use serde::Serialize;
use st_runtime::ScopeEntry;
use ts_rs::TS;

use super::program::{Breakpoint, DeviceRuntime, LogEntry};

/// One open `IF`/`ELSIF`/`WHILE` header enclosing the current line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct StackFrame {
    pub line: u32,
    pub text: String,
}

/// What the debugger shows for the targeted device
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    pub device_id: String,
    pub running: bool,
    pub paused: bool,
    pub current_line: Option<u32>,
    #[ts(type = "Array<{ name: string, type: string, value: unknown, stepTime?: number }>")]
    pub variables: Vec<ScopeEntry>,
    pub breakpoints: Vec<Breakpoint>,
    pub history: Vec<u32>,
    pub call_stack: Vec<StackFrame>,
    pub logs: Vec<LogEntry>,
}

impl DebugState {
    pub(crate) fn capture(device: &DeviceRuntime, running: bool, paused: bool, now_ms: u64) -> Self {
        let call_stack = match (device.program(), device.current_line()) {
            (Some(program), Some(line)) => call_stack(&program.source, line),
            _ => Vec::new(),
        };
        Self {
            device_id: device.id.clone(),
            running,
            paused,
            current_line: device.current_line(),
            variables: device
                .scope()
                .map(|scope| scope.snapshot(now_ms))
                .unwrap_or_default(),
            breakpoints: device.breakpoints().cloned().collect(),
            history: device.history().collect(),
            call_stack,
            logs: device.logs().cloned().collect(),
        }
    }
}

/// Open block headers on lines before `current_line`, outermost first
///
/// Rescans the source text rather than the execution: an `ELSIF` replaces
/// the `IF` it continues, `END_IF`/`END_WHILE` close the innermost header.
pub fn call_stack(source: &str, current_line: u32) -> Vec<StackFrame> {
    let mut stack: Vec<StackFrame> = Vec::new();
    for (index, raw) in source.lines().enumerate() {
        let line = index as u32 + 1;
        if line >= current_line {
            break;
        }
        let text = raw.trim();
        let upper = text.to_ascii_uppercase();
        let frame = || StackFrame {
            line,
            text: text.to_string(),
        };

        if upper.starts_with("END_IF") || upper.starts_with("END_WHILE") {
            stack.pop();
        } else if upper.starts_with("ELSIF") {
            stack.pop();
            stack.push(frame());
        } else if starts_with_word(&upper, "IF") || starts_with_word(&upper, "WHILE") {
            let closes_inline = upper.contains("END_IF") || upper.contains("END_WHILE");
            if !closes_inline {
                stack.push(frame());
            }
        }
    }
    stack
}

fn starts_with_word(text: &str, word: &str) -> bool {
    text.strip_prefix(word)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(|c: char| !c.is_ascii_alphanumeric() && c != '_'))
}
