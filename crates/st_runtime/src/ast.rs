//! Line-tagged statement tree
//!
//! Every statement carries the source line it starts on. Control constructs
//! own their nested statement lists as shared [`Block`]s so that a suspended
//! execution can hold on to them without borrowing the program.

use std::fmt;
use std::sync::Arc;

use gridsim_types::Value;
use serde::Serialize;

/// A shared list of statements
pub type Block = Arc<[Stmt]>;

// ─────────────────────────────────────────────────────────────────────────────
// Program
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled device program
#[derive(Debug, Clone)]
pub struct Program {
    /// Original source text
    pub source: Arc<str>,
    /// Declared variables in declaration order
    pub vars: Vec<VarDecl>,
    /// Top-level statements
    pub body: Block,
}

impl Program {
    /// Look up a declaration by name (case-insensitive)
    pub fn var(&self, name: &str) -> Option<&VarDecl> {
        let key = name.to_ascii_uppercase();
        self.vars.iter().find(|v| v.key == key)
    }

    /// Source lines, 1-based index friendly
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.source.lines()
    }
}

/// A `name : TYPE [:= expr];` entry from a `VAR` block
#[derive(Debug, Clone)]
pub struct VarDecl {
    /// Name as written in the declaration
    pub name: String,
    /// Upper-cased lookup key
    pub key: String,
    pub ty: VarType,
    pub init: Option<Expr>,
    pub line: u32,
}

impl VarDecl {
    /// `STATE_X : INT := N` declarations get `.stepTime` sugar
    pub fn is_state_constant(&self) -> bool {
        self.key.starts_with("STATE_") && self.ty.is_integer() && self.init.is_some()
    }
}

/// Declared variable type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VarType {
    Bool,
    Int,
    Real,
    String,
    Time,
}

impl VarType {
    /// Resolve an IEC type keyword
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "BOOL" => Some(VarType::Bool),
            "INT" | "SINT" | "DINT" | "LINT" | "UINT" | "UDINT" | "WORD" | "DWORD" => {
                Some(VarType::Int)
            }
            "REAL" | "LREAL" => Some(VarType::Real),
            "STRING" => Some(VarType::String),
            "TIME" => Some(VarType::Time),
            _ => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, VarType::Int | VarType::Time)
    }

    /// Value a variable holds before any initializer runs
    pub fn default_value(self) -> Value {
        match self {
            VarType::Bool => Value::Bool(false),
            VarType::Int | VarType::Time => Value::Int(0),
            VarType::Real => Value::Float(0.0),
            VarType::String => Value::String(String::new()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────────────

/// A statement tagged with its source line
#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `target := value;`
    Assign { target: String, value: Expr },
    /// `Device.Fn(args);`
    Call(DeviceCall),
    /// `IF c THEN .. ELSIF c THEN .. ELSE .. END_IF`
    If {
        branches: Vec<(Expr, Block)>,
        otherwise: Option<Block>,
    },
    /// `WHILE c DO .. END_WHILE`
    While { cond: Expr, body: Block },
}

// ─────────────────────────────────────────────────────────────────────────────
// Expressions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Variable reference by upper-cased key
    Var(String),
    /// `STATE_X.stepTime`
    StepTime(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Builtin {
        func: Builtin,
        args: Vec<Expr>,
    },
    Device(DeviceCall),
}

impl Expr {
    /// Whether evaluating this expression would touch the device
    pub fn calls_device(&self) -> bool {
        match self {
            Expr::Device(_) => true,
            Expr::Unary { operand, .. } => operand.calls_device(),
            Expr::Binary { lhs, rhs, .. } => lhs.calls_device() || rhs.calls_device(),
            Expr::Builtin { args, .. } => args.iter().any(Expr::calls_device),
            Expr::Literal(_) | Expr::Var(_) | Expr::StepTime(_) => false,
        }
    }

    /// Height of the expression tree; a leaf is 1
    pub fn depth(&self) -> usize {
        let deepest = |args: &[Expr]| args.iter().map(Expr::depth).max().unwrap_or(0);
        match self {
            Expr::Literal(_) | Expr::Var(_) | Expr::StepTime(_) => 1,
            Expr::Unary { operand, .. } => 1 + operand.depth(),
            Expr::Binary { lhs, rhs, .. } => 1 + lhs.depth().max(rhs.depth()),
            Expr::Builtin { args, .. } => 1 + deepest(args),
            Expr::Device(call) => 1 + deepest(&call.args),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Built-in numeric functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Sqrt,
    Abs,
    Trunc,
    ToInt,
    Mod,
}

impl Builtin {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SQRT" => Some(Builtin::Sqrt),
            "ABS" => Some(Builtin::Abs),
            "TRUNC" => Some(Builtin::Trunc),
            "TO_INT" => Some(Builtin::ToInt),
            "MOD" => Some(Builtin::Mod),
            _ => None,
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Mod => 2,
            _ => 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device API calls
// ─────────────────────────────────────────────────────────────────────────────

/// A call into the fixed `Device.*` API
#[derive(Debug, Clone)]
pub struct DeviceCall {
    pub func: DeviceFn,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFn {
    ReadInput,
    ReadRegister,
    WriteCoil,
    WriteRegister,
    GetDA,
    SetDA,
    Log,
}

impl DeviceFn {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "READINPUT" => Some(DeviceFn::ReadInput),
            "READREGISTER" => Some(DeviceFn::ReadRegister),
            "WRITECOIL" => Some(DeviceFn::WriteCoil),
            "WRITEREGISTER" => Some(DeviceFn::WriteRegister),
            "GETDA" => Some(DeviceFn::GetDA),
            "SETDA" => Some(DeviceFn::SetDA),
            "LOG" => Some(DeviceFn::Log),
            _ => None,
        }
    }

    pub fn arity(self) -> usize {
        match self {
            DeviceFn::ReadInput | DeviceFn::ReadRegister | DeviceFn::GetDA => 1,
            DeviceFn::WriteCoil | DeviceFn::WriteRegister | DeviceFn::SetDA | DeviceFn::Log => 2,
        }
    }

    /// Whether the call produces a value usable inside an expression
    pub fn returns_value(self) -> bool {
        matches!(
            self,
            DeviceFn::ReadInput | DeviceFn::ReadRegister | DeviceFn::GetDA
        )
    }
}

impl fmt::Display for DeviceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceFn::ReadInput => "ReadInput",
            DeviceFn::ReadRegister => "ReadRegister",
            DeviceFn::WriteCoil => "WriteCoil",
            DeviceFn::WriteRegister => "WriteRegister",
            DeviceFn::GetDA => "GetDA",
            DeviceFn::SetDA => "SetDA",
            DeviceFn::Log => "Log",
        };
        write!(f, "Device.{name}")
    }
}
