//! Open native store handles.

use crate::error::from_tokio_rusqlite;
use crate::registry::DbEntry;
use crate::{SchedulerError, SchedulerResult};
use std::path::Path;
use std::sync::Weak;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// An open connection to one named store.
///
/// All work runs on the connection's dedicated thread. When a call reports
/// that the connection is gone, the handle removes itself from the registry
/// so the next open creates a fresh one.
#[derive(Clone)]
pub struct DbHandle {
    id: u64,
    db_name: String,
    conn: Connection,
    entry: Weak<DbEntry>,
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle")
            .field("id", &self.id)
            .field("db_name", &self.db_name)
            .finish()
    }
}

impl DbHandle {
    /// Open the SQLite file for `db_name`, creating it when missing.
    pub(crate) async fn open(
        id: u64,
        db_name: &str,
        path: &Path,
        entry: Weak<DbEntry>,
    ) -> SchedulerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(db = %db_name, path = %path.display(), "Opening store");

        let conn = Connection::open(path)
            .await
            .map_err(|e| SchedulerError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(|e| from_tokio_rusqlite(db_name, e))?;

        Ok(Self {
            id,
            db_name: db_name.to_string(),
            conn,
            entry,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Execute a closure on the connection thread.
    ///
    /// The caller's task is parked until the result is ready. Keep the
    /// closure to SQL and light row mapping.
    pub async fn call<F, T>(&self, f: F) -> SchedulerResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> SchedulerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer_result = self.conn.call(move |conn| Ok(f(conn))).await;

        let result = match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(&self.db_name, e)),
        };

        if let Err(e) = &result {
            if e.is_closed() {
                self.deregister();
            }
        }
        result
    }

    /// Close the connection. Pending calls on the connection thread finish first.
    pub(crate) async fn close(self) {
        self.deregister();
        match self.conn.close().await {
            Ok(()) => debug!(db = %self.db_name, handle = self.id, "Handle closed"),
            Err(e) => debug!(db = %self.db_name, handle = self.id, error = %e, "Handle close reported error"),
        }
    }

    fn deregister(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.remove_handle(self.id);
        }
    }
}
