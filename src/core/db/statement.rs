/// Statement Module
///
/// A `Statement` is one compiled SQL statement with positional (and
/// optionally named) parameter slots. Each `step` fetches one row from the
/// engine and copies it into owned `Value`s, so column access never borrows
/// engine memory and only the current row is held.

use rusqlite::types::{FromSql, ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;

use crate::core::db::{Handle, QueryResult};
use crate::core::error::is_connection_failure;
use crate::core::{DbError, Result};

/// Outcome of a single `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A row is current and its columns can be read
    RowAvailable,
    /// Execution finished; no row is current
    Done,
}

/// What `reset` does with the values bound so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClearBindings {
    /// Keep every bound value so the statement can be re-run as is
    #[default]
    Keep,
    /// Unbind every placeholder; all must be bound again before the next run
    Clear,
}

/// Name and declared type of one result column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub decltype: Option<String>,
}

#[derive(Debug)]
enum ExecState {
    /// Not run since prepare or the last reset
    Ready,
    /// The engine is positioned on a row; `current` is its copy
    Stepping { current: Vec<Value> },
    Done,
}

/// A compiled statement borrowed from its `Handle`.
#[derive(Debug)]
pub struct Statement<'h> {
    handle: &'h Handle,
    /// None once finalized
    inner: Option<rusqlite::Statement<'h>>,
    sql: String,
    columns: Vec<ColumnMeta>,
    bindings: Vec<Option<Value>>,
    state: ExecState,
}

impl<'h> Statement<'h> {
    pub(crate) fn new(handle: &'h Handle, inner: rusqlite::Statement<'h>, sql: &str) -> Self {
        let columns = inner
            .columns()
            .iter()
            .map(|column| ColumnMeta {
                name: column.name().to_string(),
                decltype: column.decl_type().map(str::to_string),
            })
            .collect();
        let bindings = vec![None; inner.parameter_count()];
        Statement {
            handle,
            inner: Some(inner),
            sql: sql.to_string(),
            columns,
            bindings,
            state: ExecState::Ready,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.is_none()
    }

    /// Number of placeholders in the statement.
    pub fn parameter_count(&self) -> usize {
        self.bindings.len()
    }

    /// One-based index of a named placeholder such as `:name`, `@name` or `$name`.
    pub fn parameter_index(&self, name: &str) -> Result<Option<usize>> {
        self.live()?
            .parameter_index(name)
            .map_err(|e| DbError::Bind(e.to_string()))
    }

    /// Binds `value` to the one-based placeholder `index`.
    ///
    /// # Errors
    ///
    /// `DbError::Bind` if `index` is out of range or the value has no SQLite
    /// representation (for example a `u64` above `i64::MAX`); `DbError::State`
    /// if the statement is finalized or mid-execution (call `reset` first).
    pub fn bind<T: ToSql>(&mut self, index: usize, value: T) -> Result<()> {
        self.live()?;
        if !matches!(self.state, ExecState::Ready) {
            return Err(DbError::State("statement is executing; reset it before binding".to_string()));
        }
        if index == 0 || index > self.bindings.len() {
            return Err(DbError::Bind(format!(
                "placeholder index {} is out of range: statement has {} placeholders",
                index,
                self.bindings.len()
            )));
        }
        self.bindings[index - 1] = Some(owned_value(&value)?);
        Ok(())
    }

    /// Binds `value` to a named placeholder, including its prefix (`:id`).
    pub fn bind_named<T: ToSql>(&mut self, name: &str, value: T) -> Result<()> {
        match self.parameter_index(name)? {
            Some(index) => self.bind(index, value),
            None => Err(DbError::Bind(format!("statement has no placeholder named {}", name))),
        }
    }

    /// Binds every placeholder positionally. The slice length must match
    /// `parameter_count`.
    pub fn bind_all(&mut self, params: &[&dyn ToSql]) -> Result<()> {
        if params.len() != self.bindings.len() {
            return Err(DbError::Bind(format!(
                "expected {} parameters, got {}",
                self.bindings.len(),
                params.len()
            )));
        }
        for (i, param) in params.iter().enumerate() {
            self.bind(i + 1, *param)?;
        }
        Ok(())
    }

    /// Advances execution by one row.
    ///
    /// The first step after prepare or `reset` starts the statement; each
    /// step then fetches exactly one row from the engine. Once `Done` is
    /// returned, further steps keep returning `Done` until `reset`. An engine
    /// failure also ends the execution: rows stepped before it stay
    /// delivered, and later steps report `Done`.
    ///
    /// # Errors
    ///
    /// `DbError::Bind` if a placeholder is unbound, `DbError::Execution` with
    /// the engine's code and message if the engine fails.
    pub fn step(&mut self) -> Result<StepResult> {
        match self.state {
            ExecState::Ready => self.apply_bindings()?,
            ExecState::Stepping { .. } => {}
            ExecState::Done => {
                self.live()?;
                return Ok(StepResult::Done);
            }
        }

        let handle = self.handle;
        let column_count = self.columns.len();
        let stmt = self.inner.as_mut().ok_or_else(finalized)?;

        let mut rows = stmt.raw_query();
        let fetched = match rows.next() {
            Ok(Some(row)) => (0..column_count)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
                .map(Some)
                .map_err(|e| handle.fail(e, DbError::execution)),
            Ok(None) => Ok(None),
            Err(e) => Err(handle.fail(e, step_error)),
        };

        match fetched {
            Ok(Some(values)) => {
                // Dropping the cursor would rewind the engine statement; it
                // must stay positioned on this row for the next step.
                std::mem::forget(rows);
                self.state = ExecState::Stepping { current: values };
                Ok(StepResult::RowAvailable)
            }
            Ok(None) => {
                drop(rows);
                self.state = ExecState::Done;
                Ok(StepResult::Done)
            }
            Err(err) => {
                drop(rows);
                self.state = ExecState::Done;
                Err(err)
            }
        }
    }

    /// Rewinds the statement so it can be bound and run again without
    /// recompiling. Bindings survive unless `ClearBindings::Clear` is passed.
    pub fn reset(&mut self, bindings: ClearBindings) -> Result<()> {
        let stmt = self.inner.as_mut().ok_or_else(finalized)?;
        if matches!(self.state, ExecState::Stepping { .. }) {
            drop(stmt.raw_query());
        }
        self.state = ExecState::Ready;
        if bindings == ClearBindings::Clear {
            self.bindings.iter_mut().for_each(|slot| *slot = None);
        }
        Ok(())
    }

    /// Releases the compiled statement. Any later use, including a second
    /// `finalize`, is a `DbError::State`.
    pub fn finalize(&mut self) -> Result<()> {
        let stmt = self.inner.take().ok_or_else(finalized)?;
        self.state = ExecState::Done;
        stmt.finalize().map_err(|e| self.handle.fail(e, DbError::execution))
    }

    /// Runs the statement to completion and returns the rows it changed.
    ///
    /// Any in-progress iteration is discarded first, and the statement is
    /// left ready to run again with the same bindings. Statements that return
    /// columns report zero changes.
    pub fn execute(&mut self) -> Result<usize> {
        self.reset(ClearBindings::Keep)?;
        while self.step()? == StepResult::RowAvailable {}
        self.state = ExecState::Ready;
        if self.columns.is_empty() {
            Ok(self.handle.changes()? as usize)
        } else {
            Ok(0)
        }
    }

    /// Starts a fresh execution and returns a cursor over its rows.
    pub fn query(&mut self) -> Result<QueryResult<'_, 'h>> {
        self.reset(ClearBindings::Keep)?;
        Ok(QueryResult::new(self))
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn column_name(&self, index: usize) -> Result<&str> {
        self.column_meta(index).map(|meta| meta.name.as_str())
    }

    /// Declared type of the column in the table schema, if it has one.
    pub fn column_decltype(&self, index: usize) -> Result<Option<&str>> {
        self.column_meta(index).map(|meta| meta.decltype.as_deref())
    }

    /// Value of column `index` in the current row.
    ///
    /// # Errors
    ///
    /// `DbError::State` when no row is current (before the first step or
    /// after `Done`), `DbError::Range` when `index` is out of bounds.
    pub fn column_value(&self, index: usize) -> Result<&Value> {
        let row = self.current_row()?;
        row.get(index).ok_or(DbError::Range {
            index,
            count: row.len(),
        })
    }

    /// Reads column `index` of the current row as `T`, using the engine
    /// binding's conversion rules.
    pub fn column<T: FromSql>(&self, index: usize) -> Result<T> {
        let value = self.column_value(index)?;
        T::column_result(ValueRef::from(value)).map_err(|e| {
            DbError::Type(format!(
                "column {} ({}) holds {}: {}",
                index,
                self.columns[index].name,
                value.data_type(),
                e
            ))
        })
    }

    pub(crate) fn current_row(&self) -> Result<&[Value]> {
        self.live()?;
        match &self.state {
            ExecState::Stepping { current } => Ok(current),
            ExecState::Done => Err(DbError::State("no current row: statement has no more rows".to_string())),
            _ => Err(DbError::State("no current row: call step() first".to_string())),
        }
    }

    fn column_meta(&self, index: usize) -> Result<&ColumnMeta> {
        self.columns.get(index).ok_or(DbError::Range {
            index,
            count: self.columns.len(),
        })
    }

    fn live(&self) -> Result<&rusqlite::Statement<'h>> {
        self.inner.as_ref().ok_or_else(finalized)
    }

    /// Hands every bound value to the engine before the first step.
    fn apply_bindings(&mut self) -> Result<()> {
        if let Some(slot) = self.bindings.iter().position(Option::is_none) {
            return Err(DbError::Bind(format!("placeholder {} is not bound", slot + 1)));
        }
        let stmt = self.inner.as_mut().ok_or_else(finalized)?;
        for (i, value) in self.bindings.iter().enumerate() {
            if let Some(value) = value {
                stmt.raw_bind_parameter(i + 1, value)
                    .map_err(|e| DbError::Bind(e.to_string()))?;
            }
        }
        Ok(())
    }
}

fn finalized() -> DbError {
    DbError::State("statement has been finalized".to_string())
}

fn step_error(err: rusqlite::Error) -> DbError {
    if is_connection_failure(&err) {
        DbError::connection(err)
    } else {
        DbError::execution(err)
    }
}

/// Converts anything bindable into an owned engine value.
fn owned_value<T: ToSql>(value: &T) -> Result<Value> {
    let output = value
        .to_sql()
        .map_err(|e| DbError::Bind(format!("value cannot be bound: {}", e)))?;
    match output {
        ToSqlOutput::Borrowed(value) => Ok(value.into()),
        ToSqlOutput::Owned(value) => Ok(value),
        #[allow(unreachable_patterns)]
        _ => Err(DbError::Bind("value kind is not supported for binding".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_db_error, params};

    /// Counts 1..=5 but fails with an integer overflow when it reaches 3.
    const FAILS_AT_THIRD_ROW: &str = "
        WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5)
        SELECT CASE WHEN x = 3 THEN abs(2 - 9223372036854775807 - x) ELSE x END FROM c";

    fn handle_with_table() -> Handle {
        let handle = Handle::open_in_memory().unwrap();
        handle
            .execute_batch(
                "
                CREATE TABLE test (
                    id INTEGER PRIMARY KEY,
                    name TEXT,
                    value REAL
                );
                INSERT INTO test (name, value) VALUES ('Alice', 123.45);
                INSERT INTO test (name, value) VALUES ('Bob', 678.90);
                INSERT INTO test (name, value) VALUES (NULL, NULL);
            ",
            )
            .unwrap();
        handle
    }

    #[test]
    fn test_select_one_steps_once() {
        let handle = Handle::open_in_memory().unwrap();
        let mut stmt = handle.prepare("SELECT 1").unwrap();

        assert_db_error!(stmt.column::<i64>(0), State, "read before the first step");

        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<i64>(0).unwrap(), 1);
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        assert_eq!(stmt.step().unwrap(), StepResult::Done);

        assert_db_error!(stmt.column_value(0), State, "read after Done");
    }

    #[test]
    fn test_bind_index_out_of_range() {
        let handle = Handle::open_in_memory().unwrap();
        let mut stmt = handle.prepare("SELECT ?1, ?2").unwrap();
        assert_eq!(stmt.parameter_count(), 2);

        assert_db_error!(stmt.bind(0, 1), Bind, "index 0");
        assert_db_error!(stmt.bind(3, 1), Bind, "index past the last placeholder");
        stmt.bind(1, 1).unwrap();
        stmt.bind(2, "two").unwrap();
    }

    #[test]
    fn test_unsupported_value_is_a_bind_error() {
        let handle = Handle::open_in_memory().unwrap();
        let mut stmt = handle.prepare("SELECT ?1").unwrap();
        match stmt.bind(1, u64::MAX) {
            Err(DbError::Bind(msg)) => assert!(msg.contains("cannot be bound")),
            other => panic!("Expected Bind error, got {:?}", other),
        }
    }

    #[test]
    fn test_unbound_placeholder_fails_on_step() {
        let handle = Handle::open_in_memory().unwrap();
        let mut stmt = handle.prepare("SELECT ?1, ?2").unwrap();
        stmt.bind(1, 10).unwrap();
        match stmt.step() {
            Err(DbError::Bind(msg)) => assert!(msg.contains("placeholder 2")),
            other => panic!("Expected Bind error, got {:?}", other),
        }
    }

    #[test]
    fn test_named_parameters() {
        let handle = handle_with_table();
        let mut stmt = handle.prepare("SELECT name FROM test WHERE id = :id").unwrap();
        assert_eq!(stmt.parameter_index(":id").unwrap(), Some(1));

        stmt.bind_named(":id", 2).unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<String>(0).unwrap(), "Bob");

        stmt.reset(ClearBindings::Keep).unwrap();
        assert_db_error!(stmt.bind_named(":missing", 1), Bind, "unknown placeholder name");
    }

    #[test]
    fn test_reset_keeps_or_clears_bindings() {
        let handle = handle_with_table();
        let mut stmt = handle.prepare("SELECT name FROM test WHERE id = ?1").unwrap();
        stmt.bind(1, 1).unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<String>(0).unwrap(), "Alice");

        // Binding mid-execution is refused
        assert_db_error!(stmt.bind(1, 2), State, "bind while stepping");

        stmt.reset(ClearBindings::Keep).unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<String>(0).unwrap(), "Alice");

        stmt.reset(ClearBindings::Clear).unwrap();
        assert_db_error!(stmt.step(), Bind, "step after clearing bindings");

        stmt.bind(1, 2).unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<String>(0).unwrap(), "Bob");
    }

    #[test]
    fn test_finalize_twice_is_a_state_error() {
        let handle = Handle::open_in_memory().unwrap();
        let mut stmt = handle.prepare("SELECT 1").unwrap();
        stmt.finalize().unwrap();
        assert!(stmt.is_finalized());

        assert_db_error!(stmt.finalize(), State, "second finalize");
        assert_db_error!(stmt.step(), State, "step after finalize");
        assert_db_error!(stmt.bind(1, 1), State, "bind after finalize");
        assert_db_error!(stmt.reset(ClearBindings::Keep), State, "reset after finalize");
    }

    #[test]
    fn test_execution_error_preserves_engine_message() {
        let handle = Handle::open_in_memory().unwrap();
        handle.execute_batch("CREATE TABLE u (id INTEGER PRIMARY KEY);").unwrap();
        handle.execute("INSERT INTO u VALUES (1)", params![]).unwrap();

        let mut stmt = handle.prepare("INSERT INTO u VALUES (?1)").unwrap();
        stmt.bind(1, 1).unwrap();
        match stmt.step() {
            Err(DbError::Execution { code, message }) => {
                assert!(message.contains("UNIQUE constraint failed"));
                assert_eq!(code, Some(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY));
            }
            other => panic!("Expected Execution error, got {:?}", other),
        }
        assert_eq!(handle.last_error(), Some(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY));
    }

    #[test]
    fn test_execute_reruns_with_new_bindings() {
        let handle = handle_with_table();
        let mut stmt = handle.prepare("INSERT INTO test (name) VALUES (?1)").unwrap();
        for name in ["Carol", "Dave", "Erin"] {
            stmt.bind(1, name).unwrap();
            assert_eq!(stmt.execute().unwrap(), 1);
        }

        let count = handle
            .query_row("SELECT COUNT(*) FROM test", params![], |row| row.get_i64(0))
            .unwrap();
        assert_eq!(count, Some(6));
    }

    #[test]
    fn test_column_metadata() {
        let handle = handle_with_table();
        let stmt = handle.prepare("SELECT id, name, value, 1 + 1 AS two FROM test").unwrap();
        assert_eq!(stmt.column_count(), 4);
        assert_eq!(stmt.column_name(1).unwrap(), "name");
        assert_eq!(stmt.column_decltype(2).unwrap(), Some("REAL"));
        assert_eq!(stmt.column_decltype(3).unwrap(), None);
        assert!(matches!(stmt.column_name(4), Err(DbError::Range { index: 4, count: 4 })));
    }

    #[test]
    fn test_type_error_on_bad_coercion() {
        let handle = handle_with_table();
        let mut stmt = handle.prepare("SELECT name, value FROM test WHERE id = 3").unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);

        assert_db_error!(stmt.column::<String>(0), Type, "NULL read as String");
        assert_eq!(stmt.column::<Option<String>>(0).unwrap(), None);
        assert_db_error!(stmt.column::<i64>(5), Range, "column past the end");
    }

    #[test]
    fn test_rows_before_an_engine_failure_are_delivered() {
        let handle = Handle::open_in_memory().unwrap();
        let mut stmt = handle.prepare(FAILS_AT_THIRD_ROW).unwrap();

        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<i64>(0).unwrap(), 1);
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<i64>(0).unwrap(), 2);

        match stmt.step() {
            Err(DbError::Execution { message, .. }) => assert!(message.contains("integer overflow")),
            other => panic!("Expected Execution error, got {:?}", other),
        }
        // The failed execution is over until the statement is reset
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        assert_db_error!(stmt.column_value(0), State, "read after a failed step");

        stmt.reset(ClearBindings::Keep).unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<i64>(0).unwrap(), 1);
    }

    #[test]
    fn test_step_does_not_run_ahead_of_the_caller() {
        let handle = Handle::open_in_memory().unwrap();
        // Never terminates if run to completion
        let mut stmt = handle
            .prepare("WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c")
            .unwrap();

        for expected in 1..=5 {
            assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
            assert_eq!(stmt.column::<i64>(0).unwrap(), expected);
        }

        // Reset mid-iteration rewinds to the first row
        stmt.reset(ClearBindings::Keep).unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::RowAvailable);
        assert_eq!(stmt.column::<i64>(0).unwrap(), 1);
    }
}
