//! Error and result types for the v2 query crate.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// The query engine's closed error taxonomy.
///
/// `Io`/`NotImplemented`/`Other` are retained alongside the named kinds for
/// call sites that predate this taxonomy and report a genuinely internal or
/// not-yet-wired condition; they display as `InternalError` would. New
/// evaluation, planning, and mutation code should reach for the named
/// variant instead of `Other`.
#[derive(Debug)]
pub enum Error {
    /// A lexer/parser failure with source position.
    Syntax {
        line: u32,
        col: u32,
        message: String,
    },
    /// A variable was used with a kind incompatible with an earlier binding.
    VariableTypeConflict(String),
    /// An expression evaluated to the wrong value kind, or a function was
    /// called with the wrong number of arguments.
    TypeError(String),
    /// Integer arithmetic overflowed `i64`.
    Overflow,
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// An operation would violate a graph invariant (e.g. deleting a node
    /// with incident edges without `DETACH`).
    ConstraintViolation(String),
    /// A referenced label, relationship type, or property was not found
    /// where the operation required one to exist.
    NotFound(String),
    /// The query's cancellation token fired at a row boundary.
    Cancelled,
    /// The storage backend reported a failure.
    Storage(String),
    /// An internal invariant was broken; not caller-actionable.
    Internal(String),
    Io(io::Error),
    NotImplemented(&'static str),
    Other(String),
}

impl Error {
    pub fn type_error(msg: impl Into<String>) -> Self {
        Error::TypeError(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn constraint_violation(msg: impl Into<String>) -> Self {
        Error::ConstraintViolation(msg.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Syntax { line, col, message } => {
                write!(f, "syntax error at {line}:{col}: {message}")
            }
            Error::VariableTypeConflict(msg) => write!(f, "variable type conflict: {msg}"),
            Error::TypeError(msg) => write!(f, "type error: {msg}"),
            Error::Overflow => write!(f, "arithmetic overflow"),
            Error::DivisionByZero => write!(f, "division by zero"),
            Error::ConstraintViolation(msg) => write!(f, "constraint violation: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Cancelled => write!(f, "query cancelled"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::NotImplemented(msg) => write!(f, "not implemented: {msg}"),
            Error::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<crate::lexer::LexError> for Error {
    fn from(err: crate::lexer::LexError) -> Self {
        Error::Syntax {
            line: err.line as u32,
            col: err.column as u32,
            message: err.message,
        }
    }
}

impl From<nervusdb_v2_storage::Error> for Error {
    fn from(err: nervusdb_v2_storage::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
