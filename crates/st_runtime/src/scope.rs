//! Variable scope of one running program
//!
//! A key-value environment of tagged values. Every assignment is coerced to
//! the declared type. `STATE_X : INT := N` constants additionally carry a
//! [`StateTimer`] that remembers when the tracked `STATE` variable last
//! entered `N`, which is what `STATE_X.stepTime` reports.

use std::collections::HashMap;

use gridsim_types::Value;
use serde::Serialize;

use crate::ast::{Program, VarType};
use crate::device::Detached;
use crate::error::RuntimeError;
use crate::interpreter::evaluate;

/// Name of the variable whose transitions drive `stepTime`
pub const STATE_VARIABLE: &str = "STATE";

/// Time-in-state bookkeeping for one `STATE_X` constant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTimer {
    /// Value of `STATE` this constant stands for
    pub target: i64,
    /// When `STATE` last transitioned to `target`
    pub entered_at: Option<u64>,
}

impl StateTimer {
    /// Elapsed milliseconds since the last transition, 0 if never entered
    pub fn elapsed(&self, now_ms: u64) -> u64 {
        self.entered_at
            .map(|at| now_ms.saturating_sub(at))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct Binding {
    name: String,
    ty: VarType,
    value: Value,
    timer: Option<StateTimer>,
}

/// One row of a scope snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: VarType,
    pub value: Value,
    /// Present for `STATE_X` constants
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_time: Option<u64>,
}

/// Runtime variable environment
#[derive(Debug, Clone)]
pub struct Scope {
    bindings: HashMap<String, Binding>,
    /// Keys in declaration order
    order: Vec<String>,
    /// Last observed integer value of `STATE`
    last_state: Option<i64>,
}

impl Scope {
    /// Build the scope for `program`, running initializers in declaration order
    ///
    /// The initial value of `STATE` counts as a transition at `now_ms`.
    pub fn new(program: &Program, now_ms: u64) -> Result<Self, RuntimeError> {
        let mut scope = Scope {
            bindings: HashMap::with_capacity(program.vars.len()),
            order: Vec::with_capacity(program.vars.len()),
            last_state: None,
        };

        for decl in &program.vars {
            scope.order.push(decl.key.clone());
            scope.bindings.insert(
                decl.key.clone(),
                Binding {
                    name: decl.name.clone(),
                    ty: decl.ty,
                    value: decl.ty.default_value(),
                    timer: None,
                },
            );
        }

        let mut detached = Detached { now_ms };
        for decl in &program.vars {
            if let Some(init) = &decl.init {
                let value = evaluate(init, &scope, &mut detached)
                    .map_err(|e| e.with_line(decl.line))?;
                scope.set(&decl.key, value).map_err(|e| e.with_line(decl.line))?;
            }
            if decl.is_state_constant() {
                let target = scope
                    .get(&decl.key)
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                if let Some(binding) = scope.bindings.get_mut(&decl.key) {
                    binding.timer = Some(StateTimer {
                        target,
                        entered_at: None,
                    });
                }
            }
        }

        scope.track_state(now_ms);
        Ok(scope)
    }

    /// Current value of a variable by upper-cased key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bindings.get(key).map(|b| &b.value)
    }

    /// Look up by name as written in the source (case-insensitive)
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(&name.to_ascii_uppercase())
    }

    /// Assign, coercing to the declared type
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), RuntimeError> {
        let binding = self
            .bindings
            .get_mut(key)
            .ok_or_else(|| RuntimeError::new(format!("Unknown variable '{key}'")))?;
        binding.value = coerce(binding.ty, value, &binding.name)?;
        Ok(())
    }

    /// `STATE_X.stepTime` for the given constant key
    pub fn step_time(&self, key: &str, now_ms: u64) -> Option<u64> {
        self.bindings
            .get(key)
            .and_then(|b| b.timer)
            .map(|t| t.elapsed(now_ms))
    }

    /// Observe `STATE` and restart the timer of the constant it moved to
    ///
    /// Called after every executed statement.
    pub fn track_state(&mut self, now_ms: u64) {
        let Some(current) = self.get(STATE_VARIABLE).and_then(Value::as_i64) else {
            return;
        };
        if self.last_state == Some(current) {
            return;
        }
        self.last_state = Some(current);
        for binding in self.bindings.values_mut() {
            if let Some(timer) = binding.timer.as_mut() {
                if timer.target == current {
                    timer.entered_at = Some(now_ms);
                }
            }
        }
    }

    /// Every variable in declaration order
    pub fn snapshot(&self, now_ms: u64) -> Vec<ScopeEntry> {
        self.order
            .iter()
            .filter_map(|key| self.bindings.get(key))
            .map(|b| ScopeEntry {
                name: b.name.clone(),
                ty: b.ty,
                value: b.value.clone(),
                step_time: b.timer.map(|t| t.elapsed(now_ms)),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Convert an assigned value to the variable's declared type
fn coerce(ty: VarType, value: Value, name: &str) -> Result<Value, RuntimeError> {
    let mismatch = |value: &Value| {
        RuntimeError::new(format!(
            "Type mismatch: cannot assign {} to {name} ({})",
            value.type_name(),
            type_label(ty)
        ))
    };

    let coerced = match (ty, value) {
        (_, Value::Null) => ty.default_value(),
        (VarType::Bool, Value::Bool(b)) => Value::Bool(b),
        (VarType::Bool, Value::Int(i)) => Value::Bool(i != 0),
        (VarType::Bool, Value::Float(f)) => Value::Bool(f != 0.0),
        (VarType::Int | VarType::Time, Value::Int(i)) => Value::Int(i),
        (VarType::Int | VarType::Time, Value::Float(f)) => Value::Int(f.trunc() as i64),
        (VarType::Int | VarType::Time, Value::Bool(b)) => Value::Int(b as i64),
        (VarType::Real, Value::Float(f)) => Value::Float(f),
        (VarType::Real, Value::Int(i)) => Value::Float(i as f64),
        (VarType::Real, Value::Bool(b)) => Value::Float(if b { 1.0 } else { 0.0 }),
        (VarType::String, Value::String(s)) => Value::String(s),
        (VarType::String, other) => Value::String(other.to_string()),
        (_, other) => return Err(mismatch(&other)),
    };
    Ok(coerced)
}

fn type_label(ty: VarType) -> &'static str {
    match ty {
        VarType::Bool => "BOOL",
        VarType::Int => "INT",
        VarType::Real => "REAL",
        VarType::String => "STRING",
        VarType::Time => "TIME",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::compile;

    #[test]
    fn test_defaults_and_initializers() {
        let program = compile(
            "VAR a : BOOL; b : INT := 2 + 3; c : REAL := b; d : STRING := 'hi'; END_VAR",
        )
        .unwrap();
        let scope = Scope::new(&program, 0).unwrap();
        assert_eq!(scope.lookup("a"), Some(&Value::Bool(false)));
        assert_eq!(scope.lookup("B"), Some(&Value::Int(5)));
        assert_eq!(scope.lookup("c"), Some(&Value::Float(5.0)));
        assert_eq!(scope.lookup("d"), Some(&Value::from("hi")));
    }

    #[test]
    fn test_assignment_coerces_to_declared_type() {
        let program = compile("VAR i : INT; r : REAL; b : BOOL; END_VAR").unwrap();
        let mut scope = Scope::new(&program, 0).unwrap();
        scope.set("I", Value::Float(3.9)).unwrap();
        scope.set("R", Value::Int(2)).unwrap();
        scope.set("B", Value::Int(2)).unwrap();
        assert_eq!(scope.get("I"), Some(&Value::Int(3)));
        assert_eq!(scope.get("R"), Some(&Value::Float(2.0)));
        assert_eq!(scope.get("B"), Some(&Value::Bool(true)));
        assert!(scope.set("B", Value::from("yes")).is_err());
    }

    #[test]
    fn test_initial_state_counts_as_transition() {
        let program = compile(
            "VAR STATE : INT := 0; STATE_IDLE : INT := 0; STATE_RUN : INT := 1; END_VAR",
        )
        .unwrap();
        let mut scope = Scope::new(&program, 1_000).unwrap();
        assert_eq!(scope.step_time("STATE_IDLE", 1_250), Some(250));
        assert_eq!(scope.step_time("STATE_RUN", 1_250), Some(0));
        // The constant itself still compares as its number
        assert_eq!(scope.get("STATE_RUN"), Some(&Value::Int(1)));

        scope.set("STATE", Value::Int(1)).unwrap();
        scope.track_state(2_000);
        assert_eq!(scope.step_time("STATE_RUN", 2_400), Some(400));

        let snapshot = scope.snapshot(2_400);
        let run = snapshot.iter().find(|e| e.name == "STATE_RUN").unwrap();
        assert_eq!(run.step_time, Some(400));
    }
}
