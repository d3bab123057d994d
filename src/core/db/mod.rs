/// Database Module
///
/// This module wraps one SQLite connection and the objects derived from it.
///
/// ## Architecture
///
/// The layer is split into three concerns:
/// - **Handle** (`handle.rs`): owns one connection, its open/closed state and transactions
/// - **Statement** (`statement.rs`): one compiled statement with parameter slots and row stepping
/// - **Result cursor** (`result.rs`): typed, consumer-facing access to a statement's rows
///
/// ## Ownership
///
/// A `Statement<'h>` borrows its `Handle` and a `QueryResult<'s>` borrows its
/// `Statement`, so a handle cannot be closed or dropped while anything derived
/// from it is still alive.
pub mod handle;
pub mod result;
pub mod statement;

pub use handle::*;
pub use result::*;
pub use statement::*;
