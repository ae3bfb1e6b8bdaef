//! Event storage on a transactional SQLite store.
//!
//! One store per endpoint domain, shared by every channel instance in the
//! process (and by other processes through SQLite's own locking). Rows are
//! keyed `<iKey>::<sessionId>::<eventId>` so each instance only sees its own
//! scope; the `scopes` table records when each scope was last active so
//! abandoned scopes can be migrated or purged.

use crate::provider::{resolve_id, ProviderContext, StorageProvider};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use offline_config_and_utils::OfflineChannelConfig;
use offline_core::{
    ClockHandle, DropReason, NotificationManager, PersistenceLevel, ProviderKind, TelemetryEvent,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use txn_store_scheduler::{
    CursorQuery, CursorStep, OpenDb, SchedulerError, SchedulerResult, StoreTxn,
    TransactionScheduler, UpgradeFn,
};

/// Prefix of every store name.
pub const DB_NAME_PREFIX: &str = "OfflineEvents";

/// Schema version written to new stores.
pub const SCHEMA_VERSION: u32 = 1;

const EVTS_TABLE: &str = "evts";
const SCOPES_TABLE: &str = "scopes";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS evts (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    inserted_at INTEGER NOT NULL,
    persistence INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evts_persistence ON evts(persistence, inserted_at);
CREATE INDEX IF NOT EXISTS idx_evts_inserted_at ON evts(inserted_at);

CREATE TABLE IF NOT EXISTS scopes (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    last_access INTEGER NOT NULL
);
";

fn create_schema(tx: &rusqlite::Transaction<'_>, from: u32, to: u32) -> SchedulerResult<()> {
    debug!(from, to, "Creating offline event schema");
    tx.execute_batch(SCHEMA)?;
    Ok(())
}

/// Row payload of the `evts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRecord {
    pub key: String,
    pub id: String,
    pub evt: TelemetryEvent,
    pub inserted_at: i64,
    pub schema_version: u32,
}

/// Row payload of the `scopes` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeRecord {
    #[serde(rename = "iKey")]
    ikey: String,
    session_id: String,
}

/// Build the scope prefix for an instrumentation key and session.
pub fn scope_prefix(ikey: &str, session_id: &str) -> String {
    format!("{ikey}::{session_id}::")
}

/// What the maintenance sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SweepReport {
    migrated: usize,
    purged: usize,
}

#[derive(Debug, Clone, Copy)]
struct EvictionLimits {
    max_bytes: u64,
    drop_per_time: usize,
    max_critical_drop: usize,
}

enum InsertOutcome {
    Stored { evicted: usize },
    Full { evicted: usize },
}

struct TxnState {
    scheduler: TransactionScheduler,
    ikey: String,
    scope: String,
    scope_value: String,
    config: Arc<OfflineChannelConfig>,
    clock: ClockHandle,
    notifier: NotificationManager,
}

impl TxnState {
    async fn with_db<T, F, Fut>(&self, on_open: F) -> StorageResult<T>
    where
        F: FnOnce(OpenDb) -> Fut + Send + 'static,
        Fut: Future<Output = SchedulerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let upgrade: UpgradeFn = Arc::new(create_schema);
        Ok(self
            .scheduler
            .open_db(SCHEMA_VERSION, Some(upgrade), on_open)
            .await?)
    }

    fn limits(&self) -> EvictionLimits {
        EvictionLimits {
            max_bytes: self.config.max_storage_size_in_bytes,
            drop_per_time: self.config.events_to_drop_per_time,
            max_critical_drop: self.config.max_critical_evts_drop_cnt,
        }
    }
}

/// Provider backed by a [`TransactionScheduler`]-managed SQLite store.
#[derive(Default)]
pub struct TransactionalStorageProvider {
    state: RwLock<Option<Arc<TxnState>>>,
}

impl TransactionalStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store name for a context: prefix, configured name, endpoint domain.
    pub fn db_name_for(ctx: &ProviderContext) -> String {
        format!(
            "{DB_NAME_PREFIX}_{}_{}",
            ctx.config.db_name,
            ctx.endpoint_domain()
        )
    }

    fn state(&self) -> StorageResult<Arc<TxnState>> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.clone())
            .ok_or(StorageError::NotInitialized)
    }

    /// Read the active scope and mark it live, so a draining instance is
    /// never mistaken for an idle sibling.
    async fn read_active_scope(&self, limit: Option<usize>) -> StorageResult<Vec<TelemetryEvent>> {
        let state = self.state()?;
        let now = state.clock.now_ms();
        let scope = state.scope.clone();
        let scope_value = state.scope_value.clone();
        state
            .with_db(move |db| async move {
                let events = read_scope(&db, &scope, limit).await?;
                touch_active(&db, scope, scope_value, now).await?;
                Ok(events)
            })
            .await
    }
}

#[async_trait]
impl StorageProvider for TransactionalStorageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Transactional
    }

    async fn initialize(&self, ctx: &ProviderContext) -> bool {
        let db_name = Self::db_name_for(ctx);
        let scheduler = match ctx.registry.scheduler(&db_name) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                warn!(db = %db_name, error = %e, "Transactional store unavailable");
                return false;
            }
        };

        let scope_value = match serde_json::to_string(&ScopeRecord {
            ikey: ctx.ikey.clone(),
            session_id: ctx.session_id.clone(),
        }) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode scope record");
                return false;
            }
        };

        let state = Arc::new(TxnState {
            scheduler,
            ikey: ctx.ikey.clone(),
            scope: scope_prefix(&ctx.ikey, &ctx.session_id),
            scope_value,
            config: ctx.config.clone(),
            clock: ctx.clock.clone(),
            notifier: ctx.notifier.clone(),
        });

        let now = state.clock.now_ms();
        let scope = state.scope.clone();
        let scope_value = state.scope_value.clone();
        let ikey = ctx.ikey.clone();
        let idle_ms = ctx.config.orphan_idle_time_ms;
        let retention_ms = ctx.config.orphan_retention_time_ms;

        let result = state
            .with_db(move |db| async move {
                let report = if db.existed() {
                    sweep_orphans(&db, &scope, &ikey, now, idle_ms, retention_ms).await?
                } else {
                    SweepReport::default()
                };
                db.open_store(EVTS_TABLE, move |store| {
                    touch_scope(store.conn(), &scope, &scope_value, now)
                })
                .await?;
                Ok(report)
            })
            .await;

        match result {
            Ok(report) => {
                info!(
                    db = %db_name,
                    scope = %state.scope,
                    migrated = report.migrated,
                    purged = report.purged,
                    "Transactional provider initialized"
                );
                if let Ok(mut slot) = self.state.write() {
                    *slot = Some(state);
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                warn!(db = %db_name, error = %e, "Failed to open transactional store");
                false
            }
        }
    }

    fn supports_sync_requests(&self) -> bool {
        false
    }

    async fn add_event(&self, key: &str, mut event: TelemetryEvent) -> StorageResult<TelemetryEvent> {
        let state = self.state()?;
        resolve_id(key, &mut event, &state.clock);

        let now = state.clock.now_ms();
        let record = StorageRecord {
            key: format!("{}{}", state.scope, event.id),
            id: event.id.clone(),
            evt: event.clone(),
            inserted_at: now,
            schema_version: SCHEMA_VERSION,
        };
        let value = serde_json::to_string(&record)?;
        let record_key = record.key;
        let level = event.persistence;
        let limits = state.limits();
        let scope = state.scope.clone();
        let scope_value = state.scope_value.clone();

        let outcome = state
            .with_db(move |db| async move {
                db.open_store(EVTS_TABLE, move |store| {
                    let outcome = insert_with_eviction(store, &record_key, &value, level, now, limits)?;
                    if let InsertOutcome::Stored { .. } = outcome {
                        touch_scope(store.conn(), &scope, &scope_value, now)?;
                    }
                    Ok(outcome)
                })
                .await
            })
            .await?;

        match outcome {
            InsertOutcome::Stored { evicted } => {
                if evicted > 0 {
                    state.notifier.offline_batch_drop(evicted, DropReason::StorageFull);
                }
                debug!(id = %event.id, evicted, "Event stored");
                Ok(event)
            }
            InsertOutcome::Full { evicted } => {
                if evicted > 0 {
                    state.notifier.offline_batch_drop(evicted, DropReason::StorageFull);
                }
                warn!(id = %event.id, evicted, "Store full, event rejected");
                Err(StorageError::StoreFull(format!(
                    "no room for event {} within {} bytes",
                    event.id, limits.max_bytes
                )))
            }
        }
    }

    async fn get_next_batch(&self) -> StorageResult<Vec<TelemetryEvent>> {
        self.read_active_scope(Some(1)).await
    }

    async fn get_all_events(&self, limit: Option<usize>) -> StorageResult<Vec<TelemetryEvent>> {
        let events = self.read_active_scope(limit).await?;

        // critical first, insertion order kept within each class
        let (mut ordered, normal): (Vec<_>, Vec<_>) =
            events.into_iter().partition(|e| e.is_critical());
        ordered.extend(normal);
        Ok(ordered)
    }

    async fn remove_events(&self, events: &[TelemetryEvent]) -> StorageResult<Vec<TelemetryEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state()?;
        let now = state.clock.now_ms();
        let scope = state.scope.clone();
        let scope_value = state.scope_value.clone();
        let wanted: HashSet<String> = events.iter().map(|e| e.id.clone()).collect();

        let (removed_ids, fell_back) = state
            .with_db(move |db| async move {
                let removed = Arc::new(Mutex::new(HashSet::new()));
                let mut remaining = wanted.len();
                let cursor_scope = scope.clone();
                let cursor_removed = removed.clone();

                let summary = db
                    .open_cursor(EVTS_TABLE, CursorQuery::prefix(scope.clone()), move |entry, item| {
                        let Some(id) = entry.key.strip_prefix(cursor_scope.as_str()) else {
                            return CursorStep::Continue;
                        };
                        if !wanted.contains(id) {
                            return CursorStep::Continue;
                        }
                        remaining -= 1;
                        let last = remaining == 0;
                        let id = id.to_string();
                        let removed = cursor_removed.clone();
                        CursorStep::Waiting(Box::pin(async move {
                            item.delete().await?;
                            if let Ok(mut removed) = removed.lock() {
                                removed.insert(id);
                            }
                            Ok(if last { CursorStep::Complete } else { CursorStep::Continue })
                        }))
                    })
                    .await;

                let failed = match summary {
                    Ok(summary) => summary.failed > 0,
                    Err(e) => {
                        warn!(error = %e, "Cursor delete failed");
                        true
                    }
                };

                if failed {
                    // clear the whole scope rather than leave rows that keep failing
                    let dropped = db
                        .open_store(EVTS_TABLE, move |store| {
                            let dropped = store.delete_prefix(&scope)?;
                            touch_scope(store.conn(), &scope, &scope_value, now)?;
                            Ok(dropped)
                        })
                        .await?;
                    warn!(dropped, "Removal failed, scope cleared");
                    return Ok((HashSet::new(), true));
                }

                touch_active(&db, scope, scope_value, now).await?;
                let removed = removed.lock().map(|r| r.clone()).unwrap_or_default();
                Ok((removed, false))
            })
            .await?;

        if fell_back {
            return Ok(events.to_vec());
        }
        Ok(events
            .iter()
            .filter(|e| removed_ids.contains(&e.id))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> StorageResult<Vec<TelemetryEvent>> {
        let state = self.state()?;
        let scope = state.scope.clone();
        let values = state
            .with_db(move |db| async move {
                db.open_store(EVTS_TABLE, move |store| {
                    let values = scope_values(store, &scope)?;
                    store.delete_prefix(&scope)?;
                    Ok(values)
                })
                .await
            })
            .await?;

        let events: Vec<TelemetryEvent> = values.iter().filter_map(|v| decode(v)).collect();
        info!(count = events.len(), "Scope cleared");
        Ok(events)
    }

    /// Purge aged rows and run the orphan sweep; `disable` instead drops
    /// the whole active scope.
    async fn clean(&self, disable: bool) -> StorageResult<bool> {
        let state = self.state()?;
        let now = state.clock.now_ms();
        let cutoff = now - state.config.in_storage_max_time_ms;
        let scope = state.scope.clone();
        let scope_value = state.scope_value.clone();
        let ikey = state.ikey.clone();
        let idle_ms = state.config.orphan_idle_time_ms;
        let retention_ms = state.config.orphan_retention_time_ms;

        let (dropped, sweep) = state
            .with_db(move |db| async move {
                if disable {
                    let dropped = db
                        .open_store(EVTS_TABLE, move |store| {
                            let dropped = store.delete_prefix(&scope)?;
                            store
                                .conn()
                                .execute("DELETE FROM scopes WHERE key = ?1", params![scope])?;
                            Ok(dropped)
                        })
                        .await?;
                    return Ok((dropped, SweepReport::default()));
                }

                // migrate first so adopted rows are age-checked too
                let sweep = sweep_orphans(&db, &scope, &ikey, now, idle_ms, retention_ms).await?;
                let dropped = db
                    .open_store(EVTS_TABLE, move |store| {
                        let dropped = store
                            .conn()
                            .execute("DELETE FROM evts WHERE inserted_at < ?1", params![cutoff])?;
                        touch_scope(store.conn(), &scope, &scope_value, now)?;
                        Ok(dropped)
                    })
                    .await?;
                Ok((dropped, sweep))
            })
            .await?;

        if dropped > 0 {
            let reason = if disable {
                DropReason::Disabled
            } else {
                DropReason::MaxAgeExceeded
            };
            state.notifier.offline_batch_drop(dropped, reason);
            info!(dropped, %reason, "Stored events purged");
        }
        Ok(dropped > 0 || sweep.migrated > 0 || sweep.purged > 0)
    }

    async fn teardown(&self) {
        let state = match self.state.write() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(state) = state {
            if let Err(e) = state.scheduler.close_db().await {
                debug!(error = %e, "Close on teardown failed");
            }
            debug!(scope = %state.scope, "Transactional provider torn down");
        }
    }
}

fn decode(value: &str) -> Option<TelemetryEvent> {
    serde_json::from_str::<StorageRecord>(value)
        .ok()
        .map(|record| record.evt)
}

/// Read scoped events in insertion order, deleting rows that fail to parse.
async fn read_scope(db: &OpenDb, scope: &str, limit: Option<usize>) -> SchedulerResult<Vec<TelemetryEvent>> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut cursor = db.cursor(EVTS_TABLE, CursorQuery::prefix(scope))?;
    let mut events = Vec::new();

    while events.len() < limit {
        let Some(entry) = cursor.next().await? else {
            break;
        };
        match decode(&entry.value) {
            Some(event) => events.push(event),
            None => {
                warn!(key = %entry.key, "Dropping unreadable record");
                cursor.delete_current().await?;
            }
        }
    }
    Ok(events)
}

fn scope_values(store: &StoreTxn<'_>, scope: &str) -> SchedulerResult<Vec<String>> {
    let mut stmt = store.conn().prepare(
        "SELECT value FROM evts WHERE substr(key, 1, length(?1)) = ?1 ORDER BY rowid",
    )?;
    let values = stmt
        .query_map(params![scope], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(values)
}

async fn touch_active(db: &OpenDb, scope: String, value: String, now: i64) -> SchedulerResult<()> {
    db.open_store(SCOPES_TABLE, move |store| touch_scope(store.conn(), &scope, &value, now))
        .await
}

fn touch_scope(conn: &Connection, scope: &str, value: &str, now: i64) -> SchedulerResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO scopes (key, value, last_access) VALUES (?1, ?2, ?3)",
        params![scope, value, now],
    )?;
    Ok(())
}

/// Whether `value` fits under the byte ceiling; writes it when it does.
fn try_insert(
    store: &StoreTxn<'_>,
    key: &str,
    value: &str,
    level: PersistenceLevel,
    inserted_at: i64,
    max_bytes: u64,
) -> SchedulerResult<bool> {
    let replaced = store.get(key)?.map(|v| v.len() as u64).unwrap_or(0);
    let projected = store.total_value_bytes()?.saturating_sub(replaced) + value.len() as u64;
    if projected > max_bytes {
        return Ok(false);
    }

    match store.put(
        key,
        value,
        &[("inserted_at", inserted_at), ("persistence", level.as_i64())],
    ) {
        Ok(()) => Ok(true),
        Err(e) if e.is_store_full() => Ok(false),
        Err(e) => Err(e),
    }
}

fn insert_with_eviction(
    store: &mut StoreTxn<'_>,
    key: &str,
    value: &str,
    level: PersistenceLevel,
    inserted_at: i64,
    limits: EvictionLimits,
) -> SchedulerResult<InsertOutcome> {
    if try_insert(store, key, value, level, inserted_at, limits.max_bytes)? {
        return Ok(InsertOutcome::Stored { evicted: 0 });
    }

    let mut evicted = evict_oldest(store.conn(), PersistenceLevel::Normal, limits.drop_per_time)?;
    if evicted == 0 && level == PersistenceLevel::Critical {
        evicted = evict_oldest(store.conn(), PersistenceLevel::Critical, limits.max_critical_drop)?;
    }
    if evicted == 0 {
        return Ok(InsertOutcome::Full { evicted });
    }

    if try_insert(store, key, value, level, inserted_at, limits.max_bytes)? {
        Ok(InsertOutcome::Stored { evicted })
    } else {
        Ok(InsertOutcome::Full { evicted })
    }
}

/// Delete up to `count` of the oldest rows of one persistence level.
fn evict_oldest(conn: &Connection, level: PersistenceLevel, count: usize) -> SchedulerResult<usize> {
    if count == 0 {
        return Ok(0);
    }
    let evicted = conn.execute(
        "DELETE FROM evts WHERE rowid IN (
            SELECT rowid FROM evts WHERE persistence = ?1
            ORDER BY inserted_at ASC, rowid ASC LIMIT ?2
        )",
        params![level.as_i64(), count as i64],
    )?;
    if evicted > 0 {
        debug!(evicted, level = %level, "Evicted stored events");
    }
    Ok(evicted)
}

/// Migrate idle sibling scopes of the same iKey into `scope`, and purge
/// scopes and rows idle past the retention window.
async fn sweep_orphans(
    db: &OpenDb,
    scope: &str,
    ikey: &str,
    now: i64,
    idle_ms: i64,
    retention_ms: i64,
) -> SchedulerResult<SweepReport> {
    let scopes = db
        .open_store(SCOPES_TABLE, |store| {
            let mut stmt = store
                .conn()
                .prepare("SELECT key, value, last_access FROM scopes ORDER BY last_access")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;

    let mut report = SweepReport::default();

    for (other, value, last_access) in scopes {
        if other == scope {
            continue;
        }
        let idle_for = now - last_access;
        let record = serde_json::from_str::<ScopeRecord>(&value).ok();

        if idle_for > retention_ms || record.is_none() {
            let purge_scope = other.clone();
            report.purged += db
                .open_store(EVTS_TABLE, move |store| {
                    let purged = store.delete_prefix(&purge_scope)?;
                    store.conn().execute("DELETE FROM scopes WHERE key = ?1", params![purge_scope])?;
                    Ok(purged)
                })
                .await?;
            continue;
        }

        let same_ikey = record.map(|r| r.ikey == ikey).unwrap_or(false);
        if same_ikey && idle_for > idle_ms {
            report.migrated += migrate_scope(db, &other, scope).await?;
            let done_scope = other.clone();
            db.open_store(SCOPES_TABLE, move |store| store.delete(&done_scope))
                .await?;
        }
    }

    // rows whose scope bookkeeping is gone entirely
    let own_scope = scope.to_string();
    let cutoff = now - retention_ms;
    report.purged += db
        .open_store(EVTS_TABLE, move |store| {
            Ok(store.conn().execute(
                "DELETE FROM evts WHERE inserted_at < ?1 AND substr(key, 1, length(?2)) != ?2",
                params![cutoff, own_scope],
            )?)
        })
        .await?;

    if report.migrated > 0 || report.purged > 0 {
        info!(migrated = report.migrated, purged = report.purged, "Orphan sweep finished");
    }
    Ok(report)
}

/// Re-key every row of `from` into `to`, keeping insertion order.
async fn migrate_scope(db: &OpenDb, from: &str, to: &str) -> SchedulerResult<usize> {
    let mut cursor = db.cursor(EVTS_TABLE, CursorQuery::prefix(from))?;
    let mut moved = 0;

    while let Some(entry) = cursor.next().await? {
        let Some(id) = entry.key.strip_prefix(from) else {
            continue;
        };
        let new_key = format!("{to}{id}");

        let value = match serde_json::from_str::<StorageRecord>(&entry.value) {
            Ok(mut record) => {
                record.key = new_key.clone();
                serde_json::to_string(&record).map_err(|e| SchedulerError::Task(e.to_string()))?
            }
            Err(_) => {
                cursor.delete_current().await?;
                continue;
            }
        };

        match cursor.update_current(new_key, value).await {
            Ok(_) => moved += 1,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Migration of record failed, dropping it");
                cursor.delete_current().await?;
            }
        }
    }

    debug!(from = %from, to = %to, moved, "Scope migrated");
    Ok(moved)
}
