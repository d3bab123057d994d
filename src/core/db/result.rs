/// Result Cursor Module
///
/// `QueryResult` is the consumer-facing view of an executing statement:
/// `next()` moves to the following row and the typed accessors read the
/// current one.

use rusqlite::types::{FromSql, Type, Value};

use crate::core::db::{StepResult, Statement};
use crate::core::Result;

/// Read-only cursor over the rows of one statement execution.
///
/// The cursor starts before the first row; column access is a
/// `DbError::State` until `next()` has returned `true`, and again once it
/// has returned `false`.
#[derive(Debug)]
pub struct QueryResult<'s, 'h> {
    stmt: &'s mut Statement<'h>,
}

impl<'s, 'h> QueryResult<'s, 'h> {
    pub(crate) fn new(stmt: &'s mut Statement<'h>) -> Self {
        QueryResult { stmt }
    }

    /// Advances to the next row. Returns `false` once the rows are exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        Ok(self.stmt.step()? == StepResult::RowAvailable)
    }

    pub fn column_count(&self) -> usize {
        self.stmt.column_count()
    }

    pub fn column_name(&self, index: usize) -> Result<&str> {
        self.stmt.column_name(index)
    }

    /// Index of the column called `name`, compared case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.stmt
            .columns()
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn column_decltype(&self, index: usize) -> Result<Option<&str>> {
        self.stmt.column_decltype(index)
    }

    /// Storage class of the value in column `index` of the current row.
    pub fn column_type(&self, index: usize) -> Result<Type> {
        Ok(self.stmt.column_value(index)?.data_type())
    }

    pub fn value(&self, index: usize) -> Result<&Value> {
        self.stmt.column_value(index)
    }

    /// Reads column `index` as `T`.
    ///
    /// # Errors
    ///
    /// `DbError::Type` if the stored value cannot be converted (NULL only
    /// converts to `Option<T>`), `DbError::Range` if `index` is out of bounds.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T> {
        self.stmt.column(index)
    }

    pub fn get_i64(&self, index: usize) -> Result<i64> {
        self.get(index)
    }

    pub fn get_f64(&self, index: usize) -> Result<f64> {
        self.get(index)
    }

    pub fn get_text(&self, index: usize) -> Result<String> {
        self.get(index)
    }

    pub fn get_blob(&self, index: usize) -> Result<Vec<u8>> {
        self.get(index)
    }

    pub fn is_null(&self, index: usize) -> Result<bool> {
        Ok(matches!(self.stmt.column_value(index)?, Value::Null))
    }

    /// Drains every row not yet visited into owned values.
    pub fn collect_rows(mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        while self.next()? {
            rows.push(self.stmt.current_row()?.to_vec());
        }
        Ok(rows)
    }
}
