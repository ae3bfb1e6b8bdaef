//! Resumable cursor over an object-store table.
//!
//! A [`Cursor`] is a lazy, finite, non-restartable sequence of
//! [`CursorEntry`] values in insertion (rowid) order. The consumer controls
//! advancement: nothing is fetched until `next()` is awaited, so work done
//! between two `next()` calls (such as deleting the current row) always
//! completes before the cursor moves on.
//!
//! [`drive_cursor`] wraps the same sequence in the step protocol: the process
//! function answers [`CursorStep::Continue`], [`CursorStep::Complete`], or
//! [`CursorStep::Waiting`] with a continuation that resolves to one of the
//! other two once its per-item work is done.

use crate::handle::DbHandle;
use crate::store::prefix_condition;
use crate::{SchedulerError, SchedulerResult};
use futures_util::future::BoxFuture;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Which rows a cursor visits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorQuery {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Only rows whose integer index column equals the value.
    pub index: Option<(String, i64)>,
    /// Visit newest rows first.
    pub reverse: bool,
}

impl CursorQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn with_index(mut self, column: impl Into<String>, value: i64) -> Self {
        self.index = Some((column.into(), value));
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// One visited row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub rowid: i64,
    pub key: String,
    pub value: String,
}

/// Answer of a process function for one entry.
pub enum CursorStep {
    /// Advance to the next entry.
    Continue,
    /// Per-item work is in flight; the future resolves to `Continue` or
    /// `Complete` when it is done. The cursor does not advance meanwhile.
    Waiting(BoxFuture<'static, SchedulerResult<CursorStep>>),
    /// Stop iterating.
    Complete,
}

impl std::fmt::Debug for CursorStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "Continue"),
            Self::Waiting(_) => write!(f, "Waiting"),
            Self::Complete => write!(f, "Complete"),
        }
    }
}

/// Totals of a driven iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorSummary {
    pub visited: usize,
    /// Iterations whose continuation failed or timed out.
    pub failed: usize,
}

/// `'static` handle on the row a cursor currently points at.
///
/// Handed to process functions so a `Waiting` continuation can act on the
/// row without borrowing the cursor.
#[derive(Debug, Clone)]
pub struct CursorItem {
    handle: DbHandle,
    table: String,
    rowid: i64,
}

impl CursorItem {
    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    /// Delete this row.
    pub async fn delete(self) -> SchedulerResult<bool> {
        let sql = format!("DELETE FROM {} WHERE rowid = ?1", self.table);
        let rowid = self.rowid;
        self.handle
            .call(move |conn| Ok(conn.execute(&sql, [rowid])? > 0))
            .await
    }

    /// Replace key and value of this row, keeping its insertion position.
    pub async fn update(self, key: String, value: String) -> SchedulerResult<bool> {
        let sql = format!("UPDATE {} SET key = ?1, value = ?2 WHERE rowid = ?3", self.table);
        let rowid = self.rowid;
        self.handle
            .call(move |conn| Ok(conn.execute(&sql, rusqlite::params![key, value, rowid])? > 0))
            .await
    }
}

/// Lazy sequence of rows. See the module docs.
#[derive(Debug)]
pub struct Cursor {
    handle: DbHandle,
    table: String,
    query: CursorQuery,
    last_rowid: Option<i64>,
    buffer: VecDeque<CursorEntry>,
    current: Option<CursorEntry>,
    exhausted: bool,
    page_size: usize,
    step_timeout: Duration,
}

impl Cursor {
    pub(crate) fn new(
        handle: DbHandle,
        table: &str,
        query: CursorQuery,
        page_size: usize,
        step_timeout: Duration,
    ) -> Self {
        Self {
            handle,
            table: table.to_string(),
            query,
            last_rowid: None,
            buffer: VecDeque::new(),
            current: None,
            exhausted: false,
            page_size: page_size.max(1),
            step_timeout,
        }
    }

    /// Advance and return the next entry, or `None` once the sequence ends.
    ///
    /// A fetch that exceeds the step timeout fails this call only; the
    /// cursor keeps its position and a later call fetches again.
    pub async fn next(&mut self) -> SchedulerResult<Option<CursorEntry>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }

        self.current = self.buffer.pop_front();
        match &self.current {
            Some(entry) => self.last_rowid = Some(entry.rowid),
            None => self.exhausted = true,
        }
        Ok(self.current.clone())
    }

    pub fn current(&self) -> Option<&CursorEntry> {
        self.current.as_ref()
    }

    /// Handle on the current row for deferred work.
    pub fn current_item(&self) -> Option<CursorItem> {
        self.current.as_ref().map(|entry| CursorItem {
            handle: self.handle.clone(),
            table: self.table.clone(),
            rowid: entry.rowid,
        })
    }

    pub async fn delete_current(&mut self) -> SchedulerResult<bool> {
        match self.current_item() {
            Some(item) => item.delete().await,
            None => Ok(false),
        }
    }

    pub async fn update_current(&mut self, key: String, value: String) -> SchedulerResult<bool> {
        match self.current_item() {
            Some(item) => item.update(key, value).await,
            None => Ok(false),
        }
    }

    async fn fetch_page(&mut self) -> SchedulerResult<()> {
        let (comparison, order, start) = if self.query.reverse {
            ("<", "DESC", i64::MAX)
        } else {
            (">", "ASC", i64::MIN)
        };

        let mut conditions = vec![format!("rowid {comparison} ?1")];
        let mut values = vec![Value::Integer(self.last_rowid.unwrap_or(start))];

        if let Some(prefix) = &self.query.prefix {
            values.push(Value::Text(prefix.clone()));
            conditions.push(prefix_condition(values.len()));
        }
        if let Some((column, value)) = &self.query.index {
            let column = crate::store::validate_identifier(column)?;
            values.push(Value::Integer(*value));
            conditions.push(format!("{column} = ?{}", values.len()));
        }

        let sql = format!(
            "SELECT rowid, key, value FROM {} WHERE {} ORDER BY rowid {order} LIMIT {}",
            self.table,
            conditions.join(" AND "),
            self.page_size
        );

        let call = self.handle.call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok(CursorEntry {
                        rowid: row.get(0)?,
                        key: row.get(1)?,
                        value: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        });

        let rows = tokio::time::timeout(self.step_timeout, call)
            .await
            .map_err(|_| SchedulerError::Timeout("cursor fetch".to_string(), self.step_timeout))??;

        debug!(table = %self.table, fetched = rows.len(), "Cursor page fetched");
        self.buffer.extend(rows);
        Ok(())
    }
}

/// Drive a cursor with the step protocol.
///
/// Each `Waiting` continuation gets `step_timeout`; one that fails or never
/// resolves in time fails that iteration only and the cursor moves on.
pub async fn drive_cursor<F>(
    mut cursor: Cursor,
    mut process: F,
) -> SchedulerResult<CursorSummary>
where
    F: FnMut(&CursorEntry, CursorItem) -> CursorStep + Send,
{
    let step_timeout = cursor.step_timeout;
    let mut summary = CursorSummary::default();

    while let Some(entry) = cursor.next().await? {
        summary.visited += 1;
        let Some(item) = cursor.current_item() else {
            break;
        };

        let mut step = process(&entry, item);
        loop {
            match step {
                CursorStep::Continue => break,
                CursorStep::Complete => return Ok(summary),
                CursorStep::Waiting(continuation) => {
                    match tokio::time::timeout(step_timeout, continuation).await {
                        Ok(Ok(next)) => step = next,
                        Ok(Err(e)) => {
                            warn!(key = %entry.key, error = %e, "Cursor continuation failed");
                            summary.failed += 1;
                            break;
                        }
                        Err(_) => {
                            warn!(key = %entry.key, ?step_timeout, "Cursor continuation timed out");
                            summary.failed += 1;
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(summary)
}
