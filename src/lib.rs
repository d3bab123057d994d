// Core infrastructure modules
pub mod core;

// Pooling and configuration
pub mod config;
pub mod pool;

#[cfg(test)]
mod test_utils;

pub use crate::config::PoolConfig;
pub use crate::core::db::{
    ClearBindings, ColumnMeta, Handle, HandleId, QueryResult, Statement, StepResult, TransactionState,
};
pub use crate::core::{DbError, Result};
pub use crate::pool::{AccessMode, HandlePool, Lifecycle, PoolStatus, PooledHandle};

pub use rusqlite::types::{Type, Value};
pub use rusqlite::{params, OpenFlags, ToSql};
