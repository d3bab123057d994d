/// Core Module for handlepool
///
/// This module contains the single-connection building blocks the pool
/// multiplexes: the error taxonomy and the handle, statement and result
/// cursor wrappers over the embedded SQLite engine.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{DbError, Result};
