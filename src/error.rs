//! The crate's error taxonomy: `LexError`, `ParseError`, `CodegenError`,
//! `LoadError`, and `RuntimeError`.
//!
//! Front-end and loader errors are reported with `kind` + `message` and are
//! not catchable from Lua; `RuntimeError` is the only variant that crosses
//! a `pcall` boundary.

use std::fmt;

/// A source line number, 1-based. `0` means "no line available".
pub type Line = u32;

#[derive(Debug, Clone, PartialEq)]
pub enum LuaError {
    Lex { message: String, line: Line },
    Parse { message: String, line: Line },
    Codegen { message: String, line: Line },
    Load { message: String },
    Runtime(RuntimeError),
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    /// `source:line: message`, already formatted the way `error()` and the
    /// VM's own raises format it. Used for `Display` and for uncaught
    /// errors the host prints.
    pub message: String,
    /// Frame descriptions collected while unwinding, innermost first.
    pub traceback: Vec<String>,
    /// The exact value `error(v)` was called with, when known. `pcall`
    /// returns this (not `message`) as its second result so that
    /// `error({})`/`error(42)` round-trip the original value instead of
    /// always producing a string, matching `error`/`pcall`'s real
    /// contract; VM-internal raises (indexing nil, etc.) leave this
    /// `None` and `pcall` falls back to `message`.
    pub value: Option<crate::value::LuaValue>,
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            traceback: Vec::new(),
            value: None,
        }
    }

    pub fn with_value(message: impl Into<String>, value: crate::value::LuaValue) -> Self {
        RuntimeError {
            message: message.into(),
            traceback: Vec::new(),
            value: Some(value),
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Lex { message, line } => write!(f, "{}: lexical error: {}", line, message),
            LuaError::Parse { message, line } => write!(f, "{}: {}", line, message),
            LuaError::Codegen { message, line } => write!(f, "{}: {}", line, message),
            LuaError::Load { message } => write!(f, "cannot load chunk: {}", message),
            LuaError::Runtime(e) => write!(f, "{}", e.message),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LuaError {}
impl std::error::Error for RuntimeError {}

impl From<RuntimeError> for LuaError {
    fn from(e: RuntimeError) -> Self {
        LuaError::Runtime(e)
    }
}

pub type LuaResult<T> = Result<T, LuaError>;
