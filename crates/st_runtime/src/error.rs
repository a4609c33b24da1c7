//! Compile and runtime errors

/// A compile failure
///
/// Compilation is all-or-nothing: any error rejects the whole source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", located(.message, .line))]
pub struct CompileError {
    /// Human readable reason
    pub message: String,
    /// 1-based source line, when determinable
    pub line: Option<u32>,
}

impl CompileError {
    pub(crate) fn at(line: u32, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }

    pub(crate) fn unlocated(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }
}

/// An error raised while executing a statement
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", located(.message, .line))]
pub struct RuntimeError {
    /// Human readable reason
    pub message: String,
    /// Line of the statement being executed
    pub line: Option<u32>,
}

impl RuntimeError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub(crate) fn with_line(mut self, line: u32) -> Self {
        self.line.get_or_insert(line);
        self
    }
}

fn located(message: &str, line: &Option<u32>) -> String {
    match line {
        Some(line) => format!("line {line}: {message}"),
        None => message.to_string(),
    }
}
