//! Scoped read-write transaction over one object-store table.
//!
//! Object-store tables have the shape
//! `(key TEXT PRIMARY KEY, value TEXT NOT NULL, <integer index columns>...)`
//! and rely on SQLite's implicit rowid for insertion order.

use crate::{SchedulerError, SchedulerResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

/// Reject anything that is not a plain SQL identifier.
pub fn validate_identifier(name: &str) -> SchedulerResult<&str> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(SchedulerError::InvalidIdentifier(name.to_string()))
    }
}

/// SQL condition matching keys that start with `?N`.
pub(crate) fn prefix_condition(param_index: usize) -> String {
    format!("substr(key, 1, length(?{param_index})) = ?{param_index}")
}

/// Access to one table inside an open transaction.
///
/// Dropping the owning transaction without commit rolls back every change,
/// including nested savepoints.
pub struct StoreTxn<'a> {
    conn: &'a Connection,
    table: String,
    depth: usize,
}

impl<'a> StoreTxn<'a> {
    pub(crate) fn new(conn: &'a Connection, table: &str) -> Self {
        Self {
            conn,
            table: table.to_string(),
            depth: 0,
        }
    }

    /// Raw connection for statements the helpers below do not cover.
    /// Bind to `table` on a connection whose transaction the caller owns.
    pub fn bind(conn: &'a Connection, table: &str) -> SchedulerResult<Self> {
        Ok(Self::new(conn, validate_identifier(table)?))
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn get(&self, key: &str) -> SchedulerResult<Option<String>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", self.table);
        let value = self
            .conn
            .query_row(&sql, params![key], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value)
    }

    /// Insert or replace a row, writing integer index columns alongside.
    pub fn put(&self, key: &str, value: &str, index_columns: &[(&str, i64)]) -> SchedulerResult<()> {
        let mut columns = vec!["key".to_string(), "value".to_string()];
        let mut values = vec![Value::Text(key.to_string()), Value::Text(value.to_string())];
        for (column, column_value) in index_columns {
            columns.push(validate_identifier(column)?.to_string());
            values.push(Value::Integer(*column_value));
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();

        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> SchedulerResult<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", self.table);
        let removed = self.conn.execute(&sql, params![key])?;
        Ok(removed > 0)
    }

    /// Delete every row whose key starts with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) -> SchedulerResult<usize> {
        let sql = format!("DELETE FROM {} WHERE {}", self.table, prefix_condition(1));
        Ok(self.conn.execute(&sql, params![prefix])?)
    }

    pub fn count_prefix(&self, prefix: &str) -> SchedulerResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table, prefix_condition(1));
        let count: i64 = self.conn.query_row(&sql, params![prefix], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Total bytes of stored values across the whole table.
    ///
    /// `length` on TEXT counts characters, so values are measured as blobs.
    pub fn total_value_bytes(&self) -> SchedulerResult<u64> {
        let sql = format!(
            "SELECT COALESCE(SUM(length(CAST(value AS BLOB))), 0) FROM {}",
            self.table
        );
        let total: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(total.max(0) as u64)
    }

    /// Run `f` inside a savepoint; its changes roll back alone when it fails.
    pub fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut StoreTxn<'a>) -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        self.depth += 1;
        let name = format!("nested_{}", self.depth);
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;

        let result = f(self);
        self.depth -= 1;

        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(e) => {
                let _ = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"));
                Err(e)
            }
        }
    }
}
