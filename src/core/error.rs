/// Handlepool Error Module
///
/// This module defines the error taxonomy shared by handles, statements,
/// result cursors and the pool. Errors raised by the SQLite engine keep the
/// engine's extended result code and message so callers can inspect them.
use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Comprehensive error type for handlepool.
///
/// The variants fall into three groups:
/// - Engine failures (`Connection`, `Syntax`, `Execution`), carrying the native code
/// - Caller misuse (`Bind`, `Type`, `Range`, `State`, `Invariant`)
/// - Pool conditions (`PoolClosed`, `Timeout`)
#[derive(Error, Debug)]
pub enum DbError {
    /// Opening, closing or reopening a database file failed
    #[error("Connection error: {message}")]
    Connection { code: Option<i32>, message: String },

    /// SQL text could not be compiled
    #[error("Syntax error: {message}")]
    Syntax { code: Option<i32>, message: String },

    /// A placeholder index or name was invalid, a value could not be bound,
    /// or a statement was executed with unbound placeholders
    #[error("Bind error: {0}")]
    Bind(String),

    /// A column value could not be converted to the requested type
    #[error("Type error: {0}")]
    Type(String),

    /// A column index was out of bounds
    #[error("Range error: column {index} is out of bounds ({count} columns)")]
    Range { index: usize, count: usize },

    /// Stepping a statement failed inside the engine
    #[error("Execution error: {message}")]
    Execution { code: Option<i32>, message: String },

    /// An operation was attempted in a state that does not allow it
    #[error("State error: {0}")]
    State(String),

    /// The pool's checkout discipline was violated; always a caller bug
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// The pool is draining or shut down
    #[error("Pool closed: no handles are handed out after shutdown has begun")]
    PoolClosed,

    /// No handle became available in time
    #[error("Timed out after {0:?} waiting for a handle")]
    Timeout(Duration),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Result to use DbError as the error type.
pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Wraps an engine error raised while opening or closing a connection.
    pub fn connection(err: rusqlite::Error) -> Self {
        let (code, message) = engine_parts(&err);
        DbError::Connection { code, message }
    }

    /// Wraps an engine error raised while compiling SQL.
    pub fn syntax(err: rusqlite::Error) -> Self {
        let (code, message) = engine_parts(&err);
        DbError::Syntax { code, message }
    }

    /// Wraps an engine error raised while running a statement.
    pub fn execution(err: rusqlite::Error) -> Self {
        let (code, message) = engine_parts(&err);
        DbError::Execution { code, message }
    }

    /// The engine's extended result code, when the error came from the engine.
    pub fn code(&self) -> Option<i32> {
        match self {
            DbError::Connection { code, .. }
            | DbError::Syntax { code, .. }
            | DbError::Execution { code, .. } => *code,
            _ => None,
        }
    }

    /// Only invariant violations are treated as fatal; everything else is
    /// recoverable by the application.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Invariant(_))
    }

    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Timeout(_) => true,
            DbError::Execution {
                code: Some(code), ..
            } => {
                let primary = code & 0xff;
                primary == rusqlite::ffi::SQLITE_BUSY || primary == rusqlite::ffi::SQLITE_LOCKED
            }
            _ => false,
        }
    }
}

/// Splits an engine error into its extended result code and message.
pub(crate) fn engine_parts(err: &rusqlite::Error) -> (Option<i32>, String) {
    let code = err.sqlite_error().map(|native| native.extended_code);
    let message = match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
        other => other.to_string(),
    };
    (code, message)
}

/// Whether an engine error means the database file itself is unusable.
pub(crate) fn is_connection_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}
