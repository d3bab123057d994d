/// # Test Utilities Module
///
/// Fixtures for tests that need a real database file. A pool over
/// `:memory:` would give every handle its own private database, so pool
/// tests run against a file in a temporary directory instead.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::core::db::Handle;
use crate::pool::HandlePool;

/// A database file that is deleted together with its directory on drop.
pub struct TempDatabase {
    _dir: TempDir,
    path: PathBuf,
}

impl TempDatabase {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        TempDatabase { _dir: dir, path }
    }

    /// Create a database with an `items` table holding three rows
    pub fn with_sample_data() -> Self {
        let db = Self::new();
        let handle = Handle::open(&db.path, Default::default()).expect("Failed to open fixture database");
        handle
            .execute_batch(
                "
                CREATE TABLE items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    price REAL,
                    payload BLOB
                );
                INSERT INTO items (name, price, payload) VALUES ('alpha', 1.5, X'00FF');
                INSERT INTO items (name, price, payload) VALUES ('beta', 2.25, NULL);
                INSERT INTO items (name, price, payload) VALUES ('gamma', NULL, NULL);
            ",
            )
            .expect("Failed to create fixture schema");
        db
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self, max_size: usize) -> HandlePool {
        HandlePool::open(&self.path, max_size).expect("Failed to create pool")
    }
}

#[macro_export]
macro_rules! assert_db_error {
    ($result:expr, $expected_type:ident, $context:expr) => {
        match $result {
            Err($crate::core::DbError::$expected_type { .. }) => {}
            Ok(_) => panic!("Expected {} error but got Ok in {}", stringify!($expected_type), $context),
            Err(other) => panic!("Expected {} but got {:?} in {}", stringify!($expected_type), other, $context),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DbError, Result};
    use crate::params;

    #[test]
    fn test_sample_data_fixture() {
        let db = TempDatabase::with_sample_data();
        let handle = Handle::open(db.path(), Default::default()).unwrap();

        let count = handle
            .query_row("SELECT COUNT(*) FROM items", params![], |row| row.get_i64(0))
            .unwrap();
        assert_eq!(count, Some(3));
    }

    #[test]
    fn test_error_assertion_macro() {
        let result: Result<i32> = Err(DbError::State("Test error".to_string()));
        assert_db_error!(result, State, "macro test");

        let result: Result<i32> = Err(DbError::Range { index: 1, count: 0 });
        assert_db_error!(result, Range, "macro test");
    }
}
