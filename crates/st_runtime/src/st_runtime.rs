//! ST Runtime - Compiler and step interpreter for device logic
//!
//! This crate compiles a constrained Structured Text dialect into a
//! line-tagged statement tree and runs it one statement at a time, so a
//! scheduler can interleave many devices and a debugger can single-step.
//!
//! ```text
//! source ──lexer──▶ tokens ──parser──▶ Program (line-tagged AST)
//!                                          │
//!                 Scope + DeviceApi ──▶ Execution::step() ──▶ Suspended(line) | Completed
//! ```

mod ast;
mod device;
mod error;
mod interpreter;
mod lexer;
mod parser;
mod scope;

pub use ast::*;
pub use device::*;
pub use error::*;
pub use interpreter::*;
pub use parser::{compile, compile_condition};
pub use scope::*;
