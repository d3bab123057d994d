/// Handle Module
///
/// A `Handle` owns exactly one SQLite connection. It is either fully open or
/// fully closed, tracks its own transaction state, and remembers the last
/// engine error code it observed. Handles are `Send` but not `Sync`: one
/// thread at a time, which is what the pool's checkout discipline provides.

use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, ToSql};
use tracing::{debug, warn};

use crate::core::db::{QueryResult, Statement};
use crate::core::error::engine_parts;
use crate::core::{DbError, Result};

const MAX_BUSY_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

/// Identity of a handle within the pool that opened it.
///
/// Handles opened directly (outside a pool) all carry `HandleId::STANDALONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub const STANDALONE: HandleId = HandleId(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Represents database transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No active transaction (autocommit mode)
    #[default]
    Autocommit,
    /// Transaction in progress
    Transaction,
    /// A commit failed and the engine still holds the transaction open;
    /// only `rollback` leaves this state
    Failed,
}

/// One live connection to a database file.
#[derive(Debug)]
pub struct Handle {
    id: HandleId,
    path: PathBuf,
    flags: OpenFlags,
    /// Active connection (None once closed)
    conn: Option<Connection>,
    transaction_state: Cell<TransactionState>,
    last_error: Cell<Option<i32>>,
}

impl Handle {
    /// Opens (or creates, depending on `flags`) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the file cannot be opened or is not
    /// a readable database.
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Handle> {
        Self::open_with_id(HandleId::STANDALONE, path.as_ref(), flags)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Handle> {
        Self::open(":memory:", OpenFlags::default())
    }

    pub(crate) fn open_with_id(id: HandleId, path: &Path, flags: OpenFlags) -> Result<Handle> {
        let conn = connect(path, flags)?;
        debug!(handle = %id, path = %path.display(), "opened handle");
        Ok(Handle {
            id,
            path: path.to_path_buf(),
            flags,
            conn: Some(conn),
            transaction_state: Cell::new(TransactionState::Autocommit),
            last_error: Cell::new(None),
        })
    }

    /// Opens the connection again after `close`, using the original path and flags.
    ///
    /// Calling this on a handle that is still open is a `DbError::State`.
    pub fn reopen(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Err(DbError::State(format!("handle {} is already open", self.id)));
        }
        self.conn = Some(connect(&self.path, self.flags)?);
        self.transaction_state.set(TransactionState::Autocommit);
        debug!(handle = %self.id, "reopened handle");
        Ok(())
    }

    /// Releases the native connection. Closing a closed handle is a no-op.
    ///
    /// If the engine refuses to close, the handle stays open and the error is
    /// returned.
    pub fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        match conn.close() {
            Ok(()) => {
                self.transaction_state.set(TransactionState::Autocommit);
                debug!(handle = %self.id, "closed handle");
                Ok(())
            }
            Err((conn, err)) => {
                self.conn = Some(conn);
                self.note_error(&err);
                Err(DbError::connection(err))
            }
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state.get()
    }

    /// Extended result code of the most recent engine failure on this handle.
    pub fn last_error(&self) -> Option<i32> {
        self.last_error.get()
    }

    /// Compiles one statement.
    ///
    /// # Errors
    ///
    /// `DbError::Connection` if the handle is closed, `DbError::Syntax` if the
    /// engine rejects the SQL text.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        let conn = self.connection()?;
        let stmt = conn.prepare(sql).map_err(|e| self.fail(e, DbError::syntax))?;
        Ok(Statement::new(self, stmt, sql))
    }

    /// Prepares, binds and runs a statement to completion, returning the
    /// number of rows it changed.
    ///
    /// ```no_run
    /// # use handlepool::{Handle, params};
    /// let handle = Handle::open_in_memory()?;
    /// handle.execute("CREATE TABLE t (id INTEGER, name TEXT)", params![])?;
    /// let inserted = handle.execute("INSERT INTO t VALUES (?1, ?2)", params![1, "one"])?;
    /// assert_eq!(inserted, 1);
    /// # Ok::<(), handlepool::DbError>(())
    /// ```
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_all(params)?;
        stmt.execute()
    }

    /// Runs several `;`-separated statements that take no parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(sql).map_err(|e| self.fail(e, DbError::execution))
    }

    /// Runs a query and maps its first row, if there is one.
    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<Option<T>>
    where
        F: FnOnce(&QueryResult<'_, '_>) -> Result<T>,
    {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_all(params)?;
        let mut rows = stmt.query()?;
        if rows.next()? {
            f(&rows).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> Result<u64> {
        Ok(self.connection()?.changes() as u64)
    }

    pub fn last_insert_rowid(&self) -> Result<i64> {
        Ok(self.connection()?.last_insert_rowid())
    }

    /// Sets how long the engine retries on a locked database. The engine
    /// counts in `i32` milliseconds, so longer timeouts are capped.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        let conn = self.connection()?;
        let timeout = timeout.min(MAX_BUSY_TIMEOUT);
        conn.busy_timeout(timeout).map_err(|e| self.fail(e, DbError::execution))
    }

    pub fn pragma_update<V: ToSql>(&self, pragma: &str, value: V) -> Result<()> {
        let conn = self.connection()?;
        conn.pragma_update(None, pragma, value)
            .map_err(|e| self.fail(e, DbError::execution))
    }

    /// Whether the engine itself currently has a transaction open.
    pub fn in_engine_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| !conn.is_autocommit())
    }

    /// Starts a transaction.
    ///
    /// Nested transactions are not supported: calling this while one is
    /// already open (through this API or raw SQL) is a `DbError::State`.
    pub fn begin_transaction(&self) -> Result<()> {
        let conn = self.connection()?;
        if self.transaction_state.get() != TransactionState::Autocommit || !conn.is_autocommit() {
            return Err(DbError::State("Transaction already in progress; nested transactions are not supported".to_string()));
        }
        conn.execute_batch("BEGIN").map_err(|e| self.fail(e, DbError::execution))?;
        self.transaction_state.set(TransactionState::Transaction);
        Ok(())
    }

    /// Commits the open transaction.
    ///
    /// If the engine rejects the commit but keeps the transaction open, the
    /// handle moves to `TransactionState::Failed` until `rollback` is called.
    pub fn commit(&self) -> Result<()> {
        match self.transaction_state.get() {
            TransactionState::Transaction => {}
            TransactionState::Autocommit => {
                return Err(DbError::State("No transaction in progress".to_string()));
            }
            TransactionState::Failed => {
                return Err(DbError::State("Transaction failed; roll it back before continuing".to_string()));
            }
        }
        let conn = self.connection()?;
        match conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.transaction_state.set(TransactionState::Autocommit);
                Ok(())
            }
            Err(err) => {
                let next = if conn.is_autocommit() {
                    TransactionState::Autocommit
                } else {
                    TransactionState::Failed
                };
                self.transaction_state.set(next);
                Err(self.fail(err, DbError::execution))
            }
        }
    }

    /// Rolls back whatever transaction the engine holds open.
    ///
    /// Safe in every state: with no transaction, or on a closed handle, it
    /// does nothing.
    pub fn rollback(&self) -> Result<()> {
        let Some(conn) = self.conn.as_ref() else {
            self.transaction_state.set(TransactionState::Autocommit);
            return Ok(());
        };
        if !conn.is_autocommit() {
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                // The engine may already have rolled back on its own.
                if !conn.is_autocommit() {
                    return Err(self.fail(err, DbError::execution));
                }
            }
        }
        self.transaction_state.set(TransactionState::Autocommit);
        Ok(())
    }

    /// Runs `f` inside a transaction: commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Handle) -> Result<T>,
    {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(handle = %self.id, error = %rollback_err, "rollback after failed transaction body also failed");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn connection(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or_else(|| DbError::Connection {
            code: None,
            message: format!("handle {} is closed", self.id),
        })
    }

    /// Records the engine code of `err` and wraps it with `wrap`.
    pub(crate) fn fail(&self, err: rusqlite::Error, wrap: fn(rusqlite::Error) -> DbError) -> DbError {
        self.note_error(&err);
        wrap(err)
    }

    fn note_error(&self, err: &rusqlite::Error) {
        if let (Some(code), _) = engine_parts(err) {
            self.last_error.set(Some(code));
        }
    }
}

/// Opens a connection and reads the schema so that garbage or corrupt files
/// fail here rather than on the first query.
fn connect(path: &Path, flags: OpenFlags) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, flags).map_err(DbError::connection)?;
    conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
        .map_err(DbError::connection)?;
    Ok(conn)
}
