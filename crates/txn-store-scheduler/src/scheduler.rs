//! Per-store transaction scheduler.

use crate::cursor::{drive_cursor, Cursor, CursorEntry, CursorItem, CursorQuery, CursorStep, CursorSummary};
use crate::handle::DbHandle;
use crate::registry::{DbEntry, SchedulerRegistry};
use crate::store::{validate_identifier, StoreTxn};
use crate::{SchedulerError, SchedulerResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Schema upgrade callback: `(txn, stored_version, requested_version)`.
///
/// Runs inside the transaction that also bumps the stored version, so a
/// failing upgrade leaves the store untouched.
pub type UpgradeFn =
    Arc<dyn Fn(&rusqlite::Transaction<'_>, u32, u32) -> SchedulerResult<()> + Send + Sync>;

/// Serializes every open, delete and close against one named store.
#[derive(Clone)]
pub struct TransactionScheduler {
    registry: Arc<SchedulerRegistry>,
    entry: Arc<DbEntry>,
}

impl std::fmt::Debug for TransactionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScheduler")
            .field("db_name", &self.entry.name)
            .finish()
    }
}

impl TransactionScheduler {
    pub(crate) fn new(registry: Arc<SchedulerRegistry>, entry: Arc<DbEntry>) -> Self {
        Self { registry, entry }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Open the store at `version` and run `on_open` with it.
    ///
    /// The whole call is one queued task: it starts after every earlier task
    /// for this store has settled. `on_open` must not enqueue further work
    /// on the same store and wait for it, since that work would queue
    /// behind the task currently running.
    ///
    /// A store that is missing or older than `version` runs `on_upgrade`;
    /// without one the open fails with [`SchedulerError::UpgradeRequired`].
    pub async fn open_db<T, F, Fut>(
        &self,
        version: u32,
        on_upgrade: Option<UpgradeFn>,
        on_open: F,
    ) -> SchedulerResult<T>
    where
        F: FnOnce(OpenDb) -> Fut + Send + 'static,
        Fut: Future<Output = SchedulerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if version == 0 {
            return Err(SchedulerError::Task("store version must be at least 1".to_string()));
        }

        let registry = self.registry.clone();
        let entry = self.entry.clone();

        self.entry
            .enqueue("open_db", async move {
                let (handle, existed) = acquire(&registry, &entry, version, on_upgrade).await?;
                let config = registry.config();
                on_open(OpenDb {
                    handle,
                    existed,
                    version,
                    step_timeout: config.step_timeout,
                    page_size: config.cursor_page_size,
                })
                .await
            })
            .await
    }

    /// Force-close all handles, wait briefly, then remove the store files.
    pub async fn delete_db(&self) -> SchedulerResult<()> {
        self.entry.close_all_handles().await;
        tokio::time::sleep(self.registry.config().delete_defer).await;

        let entry = self.entry.clone();
        self.entry
            .enqueue("delete_db", async move {
                // an open may have slipped in during the defer window
                entry.close_all_handles().await;

                let base = entry.path.to_string_lossy().to_string();
                let mut removed = false;
                for path in [base.clone(), format!("{base}-wal"), format!("{base}-shm")] {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => removed = true,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(SchedulerError::Io(e)),
                    }
                }
                info!(db = %entry.name, removed, "Store deleted");
                Ok(())
            })
            .await
    }

    /// Close every handle once earlier tasks have settled.
    pub async fn close_db(&self) -> SchedulerResult<()> {
        let entry = self.entry.clone();
        self.entry
            .enqueue("close_db", async move {
                entry.close_all_handles().await;
                debug!(db = %entry.name, "Store closed");
                Ok(())
            })
            .await
    }
}

/// Reuse an open handle or open a new one, then bring it to `version`.
async fn acquire(
    registry: &SchedulerRegistry,
    entry: &Arc<DbEntry>,
    version: u32,
    on_upgrade: Option<UpgradeFn>,
) -> SchedulerResult<(DbHandle, bool)> {
    if let Some(handle) = entry.first_handle() {
        match check_version(&handle, version, on_upgrade.clone()).await {
            Ok(existed) => return Ok((handle, existed)),
            // stale handle, fall through and reopen
            Err(e) if e.is_closed() => {
                warn!(db = %entry.name, handle = handle.id(), "Cached handle was closed, reopening");
            }
            Err(e) => return Err(e),
        }
    }

    let handle = DbHandle::open(
        registry.next_handle_id(),
        &entry.name,
        &entry.path,
        Arc::downgrade(entry),
    )
    .await?;

    match check_version(&handle, version, on_upgrade).await {
        Ok(existed) => {
            entry.register_handle(handle.clone());
            Ok((handle, existed))
        }
        Err(e) => {
            handle.close().await;
            Err(e)
        }
    }
}

/// Compare the stored version with `version`, upgrading when allowed.
/// Returns whether the store existed before this call.
async fn check_version(
    handle: &DbHandle,
    version: u32,
    on_upgrade: Option<UpgradeFn>,
) -> SchedulerResult<bool> {
    let db_name = handle.db_name().to_string();

    handle
        .call(move |conn| {
            let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

            if current == version {
                return Ok(true);
            }
            if current > version {
                return Err(SchedulerError::VersionMismatch {
                    found: current,
                    requested: version,
                });
            }

            let Some(upgrade) = on_upgrade else {
                return Err(SchedulerError::UpgradeRequired {
                    current,
                    requested: version,
                });
            };

            let tx = conn.transaction()?;
            upgrade(&tx, current, version)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;

            info!(db = %db_name, from = current, to = version, "Store upgraded");
            Ok(current > 0)
        })
        .await
}

/// An opened store, valid for the duration of one `open_db` task.
#[derive(Debug, Clone)]
pub struct OpenDb {
    handle: DbHandle,
    existed: bool,
    version: u32,
    step_timeout: Duration,
    page_size: usize,
}

impl OpenDb {
    /// Whether the store was already present before this open.
    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn handle(&self) -> &DbHandle {
        &self.handle
    }

    /// Run `action` against `table` inside one read-write transaction.
    ///
    /// The transaction commits when `action` returns `Ok` and rolls back
    /// otherwise.
    pub async fn open_store<T, F>(&self, table: &str, action: F) -> SchedulerResult<T>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> SchedulerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let table = validate_identifier(table)?.to_string();
        self.handle
            .call(move |conn| {
                let tx = conn.transaction()?;
                let result = {
                    let mut store = StoreTxn::new(&tx, &table);
                    action(&mut store)?
                };
                tx.commit()?;
                Ok(result)
            })
            .await
    }

    /// Lazy cursor the caller advances with [`Cursor::next`].
    pub fn cursor(&self, table: &str, query: CursorQuery) -> SchedulerResult<Cursor> {
        let table = validate_identifier(table)?;
        Ok(Cursor::new(
            self.handle.clone(),
            table,
            query,
            self.page_size,
            self.step_timeout,
        ))
    }

    /// Visit rows with the step protocol until the process function
    /// answers `Complete` or the rows run out.
    pub async fn open_cursor<F>(
        &self,
        table: &str,
        query: CursorQuery,
        process: F,
    ) -> SchedulerResult<CursorSummary>
    where
        F: FnMut(&CursorEntry, CursorItem) -> CursorStep + Send,
    {
        let cursor = self.cursor(table, query)?;
        drive_cursor(cursor, process).await
    }
}
