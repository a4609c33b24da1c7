//! Resumable statement interpreter
//!
//! An [`Execution`] is an explicit stack of frames, each a program counter
//! into a shared [`Block`]. [`Execution::step`] runs exactly one statement
//! and reports the line it suspended on:
//!
//! - assignments and calls suspend once, after they run
//! - `IF` suspends once at its header, after choosing a branch
//! - `WHILE` suspends at its header every time the condition is evaluated
//!
//! Reaching the end of the top-level block yields [`StepOutcome::Completed`].

use gridsim_types::Value;

use crate::ast::*;
use crate::device::{DeviceApi, LogLevel};
use crate::error::RuntimeError;
use crate::scope::Scope;

/// Result of advancing an execution by one statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A statement ran; the value is its source line
    Suspended(u32),
    /// The program ran off its end
    Completed,
}

#[derive(Debug, Clone)]
struct Frame {
    body: Block,
    pc: usize,
}

/// In-flight run of a program
#[derive(Debug, Clone)]
pub struct Execution {
    frames: Vec<Frame>,
}

impl Execution {
    /// Start a fresh run at the first top-level statement
    pub fn new(program: &Program) -> Self {
        Self {
            frames: vec![Frame {
                body: program.body.clone(),
                pc: 0,
            }],
        }
    }

    /// Number of nested blocks currently open
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Run the next statement
    pub fn step(
        &mut self,
        scope: &mut Scope,
        api: &mut dyn DeviceApi,
    ) -> Result<StepOutcome, RuntimeError> {
        loop {
            let Some(frame) = self.frames.last() else {
                return Ok(StepOutcome::Completed);
            };
            if frame.pc >= frame.body.len() {
                // A finished loop body leaves the parent pc on its WHILE,
                // so the condition is evaluated again on the next iteration.
                self.frames.pop();
                continue;
            }

            let body = frame.body.clone();
            let stmt = &body[frame.pc];
            let line = stmt.line;

            self.execute(stmt, scope, api)
                .map_err(|e| e.with_line(line))?;
            scope.track_state(api.now_ms());
            return Ok(StepOutcome::Suspended(line));
        }
    }

    fn execute(
        &mut self,
        stmt: &Stmt,
        scope: &mut Scope,
        api: &mut dyn DeviceApi,
    ) -> Result<(), RuntimeError> {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                let value = evaluate(value, scope, api)?;
                scope.set(target, value)?;
                self.advance();
            }
            StmtKind::Call(call) => {
                call_device(call, scope, api)?;
                self.advance();
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                let mut chosen = None;
                for (cond, block) in branches {
                    if condition(cond, scope, api)? {
                        chosen = Some(block.clone());
                        break;
                    }
                }
                self.advance();
                if let Some(block) = chosen.or_else(|| otherwise.clone()) {
                    self.frames.push(Frame { body: block, pc: 0 });
                }
            }
            StmtKind::While { cond, body } => {
                if condition(cond, scope, api)? {
                    self.frames.push(Frame {
                        body: body.clone(),
                        pc: 0,
                    });
                } else {
                    self.advance();
                }
            }
        }
        Ok(())
    }

    fn advance(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc += 1;
        }
    }
}

fn condition(
    expr: &Expr,
    scope: &Scope,
    api: &mut dyn DeviceApi,
) -> Result<bool, RuntimeError> {
    match evaluate(expr, scope, api)? {
        Value::Bool(b) => Ok(b),
        other => Err(RuntimeError::new(format!(
            "Condition must be BOOL, got {}",
            other.type_name()
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Expressions
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluate an expression against a scope and device
pub fn evaluate(
    expr: &Expr,
    scope: &Scope,
    api: &mut dyn DeviceApi,
) -> Result<Value, RuntimeError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(key) => scope
            .get(key)
            .cloned()
            .ok_or_else(|| RuntimeError::new(format!("Unknown variable '{key}'"))),
        Expr::StepTime(key) => {
            let elapsed = scope.step_time(key, api.now_ms()).unwrap_or(0);
            Ok(Value::Int(elapsed as i64))
        }
        Expr::Unary { op, operand } => {
            let v = evaluate(operand, scope, api)?;
            unary(*op, v)
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = evaluate(lhs, scope, api)?;
            // Boolean AND/OR short-circuit; the right side may call the device
            match (op, &l) {
                (BinaryOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
                (BinaryOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let r = evaluate(rhs, scope, api)?;
            binary(*op, l, r)
        }
        Expr::Builtin { func, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, scope, api)?);
            }
            builtin(*func, values)
        }
        Expr::Device(call) => call_device(call, scope, api),
    }
}

fn unary(op: UnaryOp, v: Value) -> Result<Value, RuntimeError> {
    match (op, v) {
        (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Not, Value::Int(i)) => Ok(Value::Int(!i)),
        (op, v) => Err(RuntimeError::new(format!(
            "Type mismatch: cannot apply {} to {}",
            match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "NOT",
            },
            v.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, RuntimeError> {
    use BinaryOp::*;

    let mismatch = |l: &Value, r: &Value| {
        RuntimeError::new(format!(
            "Type mismatch: {} {} {}",
            l.type_name(),
            op_symbol(op),
            r.type_name()
        ))
    };

    match op {
        And | Or => match (&l, &r) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == And {
                *a && *b
            } else {
                *a || *b
            })),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(if op == And { a & b } else { a | b })),
            _ => Err(mismatch(&l, &r)),
        },
        Eq => Ok(Value::Bool(equals(&l, &r))),
        Ne => Ok(Value::Bool(!equals(&l, &r))),
        Lt | Le | Gt | Ge => {
            let ordering = match (&l, &r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                (a, b) if a.is_number() && b.is_number() => {
                    a.as_f64().partial_cmp(&b.as_f64())
                }
                _ => return Err(mismatch(&l, &r)),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        Add | Sub | Mul | Div | Mod => arithmetic(op, &l, &r).ok_or_else(|| mismatch(&l, &r))?,
    }
}

/// `None` means the operand types do not support the operator
fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Option<Result<Value, RuntimeError>> {
    use BinaryOp::*;

    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let (a, b) = (*a, *b);
        let result = match op {
            Add => Ok(a.wrapping_add(b)),
            Sub => Ok(a.wrapping_sub(b)),
            Mul => Ok(a.wrapping_mul(b)),
            Div if b == 0 => Err(RuntimeError::new("Division by zero")),
            Div => Ok(a.wrapping_div(b)),
            Mod if b == 0 => Err(RuntimeError::new("Modulo by zero")),
            Mod => Ok(a.wrapping_rem(b)),
            _ => return None,
        };
        return Some(result.map(Value::Int));
    }

    if !(l.is_number() && r.is_number()) {
        return None;
    }
    let a = l.as_f64()?;
    let b = r.as_f64()?;
    let result = match op {
        Add => Ok(a + b),
        Sub => Ok(a - b),
        Mul => Ok(a * b),
        Div if b == 0.0 => Err(RuntimeError::new("Division by zero")),
        Div => Ok(a / b),
        Mod if b == 0.0 => Err(RuntimeError::new("Modulo by zero")),
        Mod => Ok(a % b),
        _ => return None,
    };
    Some(result.map(Value::Float))
}

/// `=` semantics: numbers compare numerically, mismatched kinds are unequal
fn equals(l: &Value, r: &Value) -> bool {
    if l.is_number() && r.is_number() {
        return l.as_f64() == r.as_f64();
    }
    l == r
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Or => "OR",
        BinaryOp::And => "AND",
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "<>",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "MOD",
    }
}

fn builtin(func: Builtin, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let mut args = args.into_iter();
    let first = args.next().unwrap_or_default();

    match func {
        Builtin::Mod => {
            let second = args.next().unwrap_or_default();
            binary(BinaryOp::Mod, first, second)
        }
        Builtin::Sqrt => {
            let x = number(&first, "SQRT")?;
            if x < 0.0 {
                return Err(RuntimeError::new(format!("SQRT of negative number {x}")));
            }
            Ok(Value::Float(x.sqrt()))
        }
        Builtin::Abs => match first {
            Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
            other => Ok(Value::Float(number(&other, "ABS")?.abs())),
        },
        Builtin::Trunc => match first {
            Value::Int(i) => Ok(Value::Int(i)),
            other => Ok(Value::Int(number(&other, "TRUNC")?.trunc() as i64)),
        },
        Builtin::ToInt => match first {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            other => Ok(Value::Int(number(&other, "TO_INT")?.round() as i64)),
        },
    }
}

fn number(v: &Value, func: &str) -> Result<f64, RuntimeError> {
    v.as_f64().ok_or_else(|| {
        RuntimeError::new(format!(
            "Type mismatch: {func} expects a number, got {}",
            v.type_name()
        ))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Device calls
// ─────────────────────────────────────────────────────────────────────────────

fn call_device(
    call: &DeviceCall,
    scope: &Scope,
    api: &mut dyn DeviceApi,
) -> Result<Value, RuntimeError> {
    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(evaluate(arg, scope, api)?);
    }
    let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

    match call.func {
        DeviceFn::ReadInput => {
            let address = address(&arg(0), call.func)?;
            Ok(Value::Bool(api.read_input(address)))
        }
        DeviceFn::ReadRegister => {
            let address = address(&arg(0), call.func)?;
            Ok(Value::Int(api.read_register(address) as i64))
        }
        DeviceFn::WriteCoil => {
            let address = address(&arg(0), call.func)?;
            let value = match arg(1) {
                Value::Bool(b) => b,
                v if v.is_number() => v.truthy(),
                v => {
                    return Err(RuntimeError::new(format!(
                        "Type mismatch: {} expects BOOL, got {}",
                        call.func,
                        v.type_name()
                    )));
                }
            };
            api.write_coil(address, value);
            Ok(Value::Null)
        }
        DeviceFn::WriteRegister => {
            let address = address(&arg(0), call.func)?;
            let value = register_word(&arg(1), call.func)?;
            api.write_register(address, value);
            Ok(Value::Null)
        }
        DeviceFn::GetDA => {
            let path = path(&arg(0), call.func)?;
            Ok(api.get_da(&path))
        }
        DeviceFn::SetDA => {
            let path = path(&arg(0), call.func)?;
            api.set_da(&path, arg(1));
            Ok(Value::Null)
        }
        DeviceFn::Log => {
            let level = LogLevel::parse(&arg(0).to_string());
            api.log(level, &arg(1).to_string());
            Ok(Value::Null)
        }
    }
}

fn address(v: &Value, func: DeviceFn) -> Result<u16, RuntimeError> {
    v.as_f64()
        .map(f64::trunc)
        .filter(|a| (0.0..=65535.0).contains(a))
        .map(|a| a as u16)
        .ok_or_else(|| RuntimeError::new(format!("{func}: invalid address {v}")))
}

/// Register payload; negative values are stored as two's complement
fn register_word(v: &Value, func: DeviceFn) -> Result<u16, RuntimeError> {
    let n = match v {
        Value::Bool(b) => *b as i64,
        Value::Int(i) => *i,
        Value::Float(f) => f.trunc() as i64,
        other => {
            return Err(RuntimeError::new(format!(
                "Type mismatch: {func} expects a number, got {}",
                other.type_name()
            )));
        }
    };
    if !(-32768..=65535).contains(&n) {
        return Err(RuntimeError::new(format!(
            "{func}: value {n} does not fit in a register"
        )));
    }
    Ok(n as u16)
}

fn path(v: &Value, func: DeviceFn) -> Result<String, RuntimeError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(RuntimeError::new(format!(
            "Type mismatch: {func} expects a STRING path, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::parser::compile;

    #[derive(Default)]
    struct FakeDevice {
        now: u64,
        inputs: HashMap<u16, bool>,
        registers: HashMap<u16, u16>,
        coils: HashMap<u16, bool>,
        attributes: HashMap<String, Value>,
        logs: Vec<(LogLevel, String)>,
        input_reads: usize,
    }

    impl DeviceApi for FakeDevice {
        fn now_ms(&self) -> u64 {
            self.now
        }
        fn read_input(&mut self, address: u16) -> bool {
            self.input_reads += 1;
            self.inputs.get(&address).copied().unwrap_or(false)
        }
        fn read_register(&mut self, address: u16) -> u16 {
            self.registers.get(&address).copied().unwrap_or(0)
        }
        fn write_coil(&mut self, address: u16, value: bool) {
            self.coils.insert(address, value);
        }
        fn write_register(&mut self, address: u16, value: u16) {
            self.registers.insert(address, value);
        }
        fn get_da(&mut self, path: &str) -> Value {
            self.attributes.get(path).cloned().unwrap_or_default()
        }
        fn set_da(&mut self, path: &str, value: Value) {
            self.attributes.insert(path.to_string(), value);
        }
        fn log(&mut self, level: LogLevel, message: &str) {
            self.logs.push((level, message.to_string()));
        }
    }

    /// Run to completion, collecting suspension lines
    fn run(source: &str, device: &mut FakeDevice) -> (Scope, Vec<u32>) {
        let program = compile(source).unwrap();
        let mut scope = Scope::new(&program, device.now).unwrap();
        let mut execution = Execution::new(&program);
        let mut lines = Vec::new();
        for _ in 0..1_000 {
            match execution.step(&mut scope, device).unwrap() {
                StepOutcome::Suspended(line) => lines.push(line),
                StepOutcome::Completed => return (scope, lines),
            }
        }
        panic!("program did not complete");
    }

    #[test]
    fn test_and_or_short_circuit() {
        let mut device = FakeDevice::default();
        let (scope, _) = run(
            "VAR a : BOOL := FALSE; b : BOOL := TRUE; x : BOOL; y : BOOL; z : BOOL; END_VAR\n\
             x := a AND Device.ReadInput(1);\n\
             y := b OR Device.ReadInput(2);\n\
             z := a AND 1 / 0 = 1;",
            &mut device,
        );
        assert_eq!(device.input_reads, 0);
        assert_eq!(scope.lookup("x"), Some(&Value::Bool(false)));
        assert_eq!(scope.lookup("y"), Some(&Value::Bool(true)));
        assert_eq!(scope.lookup("z"), Some(&Value::Bool(false)));

        let (scope, _) = run(
            "VAR b : BOOL := TRUE; x : BOOL; END_VAR\nx := b AND Device.ReadInput(1);",
            &mut device,
        );
        assert_eq!(device.input_reads, 1);
        assert_eq!(scope.lookup("x"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_single_if_scenario() {
        let mut device = FakeDevice::default();
        let (scope, lines) = run(
            "VAR x:INT:=0; END_VAR IF x=0 THEN x:=1; END_IF;",
            &mut device,
        );
        assert_eq!(scope.lookup("x"), Some(&Value::Int(1)));
        assert_eq!(lines, vec![1, 1]);
    }

    #[test]
    fn test_one_suspension_per_line_honoring_branches() {
        let source = "\
VAR x : INT := 5; y : INT; END_VAR
IF x > 10 THEN
  y := 1;
ELSIF x > 3 THEN
  y := 2;
ELSE
  y := 3;
END_IF;
y := y + 10;
";
        let mut device = FakeDevice::default();
        let (scope, lines) = run(source, &mut device);
        assert_eq!(lines, vec![2, 5, 9]);
        assert_eq!(scope.lookup("y"), Some(&Value::Int(12)));
    }

    #[test]
    fn test_while_suspends_at_header_each_evaluation() {
        let source = "\
VAR i : INT; END_VAR
WHILE i < 2 DO
  i := i + 1;
END_WHILE;
";
        let mut device = FakeDevice::default();
        let (scope, lines) = run(source, &mut device);
        assert_eq!(lines, vec![2, 3, 2, 3, 2]);
        assert_eq!(scope.lookup("i"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_device_calls() {
        let source = "\
VAR v : INT; on : BOOL; pos : INT; END_VAR
v := Device.ReadRegister(40001);
on := Device.ReadInput(3);
IF on THEN
  Device.WriteCoil(10, TRUE);
  Device.WriteRegister(40002, v * 2);
END_IF;
pos := Device.GetDA('IED1LD0/XCBR1.Pos.stVal');
Device.SetDA('IED1LD0/MMXU1.TotW.mag.f', 1.5);
Device.Log('warn', 'pos is ' );
";
        let mut device = FakeDevice::default();
        device.registers.insert(40001, 21);
        device.inputs.insert(3, true);
        device
            .attributes
            .insert("IED1LD0/XCBR1.Pos.stVal".into(), Value::Int(2));

        let (scope, _) = run(source, &mut device);
        assert_eq!(device.coils.get(&10), Some(&true));
        assert_eq!(device.registers.get(&40002), Some(&42));
        assert_eq!(scope.lookup("pos"), Some(&Value::Int(2)));
        assert_eq!(
            device.attributes.get("IED1LD0/MMXU1.TotW.mag.f"),
            Some(&Value::Float(1.5))
        );
        assert_eq!(device.logs[0].0, LogLevel::Warn);
    }

    #[test]
    fn test_arithmetic_and_builtins() {
        let source = "\
VAR a : INT; b : REAL; c : INT; d : INT; e : REAL; f : BOOL; END_VAR
a := 7 / 2;
b := 7.0 / 2;
c := 7 MOD 3 + MOD(9, 4);
d := TO_INT(2.6) + TRUNC(-1.7);
e := SQRT(16) + ABS(-2);
f := NOT (a = 3) OR (b >= 3.5 AND 1 = 1.0);
";
        let mut device = FakeDevice::default();
        let (scope, _) = run(source, &mut device);
        assert_eq!(scope.lookup("a"), Some(&Value::Int(3)));
        assert_eq!(scope.lookup("b"), Some(&Value::Float(3.5)));
        assert_eq!(scope.lookup("c"), Some(&Value::Int(2)));
        assert_eq!(scope.lookup("d"), Some(&Value::Int(2)));
        assert_eq!(scope.lookup("e"), Some(&Value::Float(6.0)));
        assert_eq!(scope.lookup("f"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_runtime_errors_carry_line() {
        let program = compile("VAR a : INT; END_VAR\na := 1;\na := a / 0;").unwrap();
        let mut device = FakeDevice::default();
        let mut scope = Scope::new(&program, 0).unwrap();
        let mut execution = Execution::new(&program);
        assert_eq!(
            execution.step(&mut scope, &mut device).unwrap(),
            StepOutcome::Suspended(2)
        );
        let err = execution.step(&mut scope, &mut device).unwrap_err();
        assert_eq!(err.line, Some(3));
        assert_eq!(err.message, "Division by zero");

        let program = compile("VAR r : REAL; END_VAR\nr := SQRT(-1);").unwrap();
        let mut scope = Scope::new(&program, 0).unwrap();
        let mut execution = Execution::new(&program);
        assert!(execution.step(&mut scope, &mut device).is_err());
    }

    #[test]
    fn test_step_time_tracks_state_transitions() {
        let source = "\
VAR STATE : INT := 0; STATE_IDLE : INT := 0; STATE_RUN : INT := 1; t : INT; END_VAR
STATE := STATE_RUN;
t := STATE_RUN.stepTime;
";
        let program = compile(source).unwrap();
        let mut device = FakeDevice {
            now: 1_000,
            ..Default::default()
        };
        let mut scope = Scope::new(&program, device.now).unwrap();
        let mut execution = Execution::new(&program);

        device.now = 1_500;
        execution.step(&mut scope, &mut device).unwrap();
        device.now = 1_800;
        execution.step(&mut scope, &mut device).unwrap();

        assert_eq!(scope.lookup("t"), Some(&Value::Int(300)));
        assert_eq!(scope.lookup("STATE"), Some(&Value::Int(1)));
        assert_eq!(scope.step_time("STATE_IDLE", 1_800), Some(800));
    }

    #[test]
    fn test_empty_program_completes_immediately() {
        let program = compile("VAR x : INT; END_VAR").unwrap();
        let mut device = FakeDevice::default();
        let mut scope = Scope::new(&program, 0).unwrap();
        let mut execution = Execution::new(&program);
        assert_eq!(
            execution.step(&mut scope, &mut device).unwrap(),
            StepOutcome::Completed
        );
    }
}
