//! Explicitly owned registry of named stores.
//!
//! Each database name gets one entry holding its open handles and a FIFO task
//! queue. The queue is the only ordering primitive: a task enqueued before
//! another against the same name finishes (or fails) before the later one
//! starts. Independent registries share nothing, so tests and separate
//! channel instances never leak state into each other.

use crate::handle::DbHandle;
use crate::scheduler::TransactionScheduler;
use crate::{SchedulerError, SchedulerResult};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type QueuedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Scheduler settings shared by every store in a registry.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory holding one `<name>.sqlite` file per store.
    pub base_dir: PathBuf,
    /// Deadline for one queued task.
    pub task_timeout: Duration,
    /// Deadline for one cursor step.
    pub step_timeout: Duration,
    /// Pause between force-closing handles and deleting a store.
    pub delete_defer: Duration,
    /// Rows fetched per cursor round trip.
    pub cursor_page_size: usize,
}

impl SchedulerConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            task_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(5),
            delete_defer: Duration::from_millis(50),
            cursor_page_size: 50,
        }
    }
}

/// Registry of named stores.
///
/// Construct one per owner (usually one per offline channel), hand clones of
/// the `Arc` to providers, and call [`SchedulerRegistry::teardown`] on shutdown.
pub struct SchedulerRegistry {
    config: SchedulerConfig,
    databases: Mutex<HashMap<String, Arc<DbEntry>>>,
    next_handle_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("base_dir", &self.config.base_dir)
            .field("databases", &self.database_names())
            .finish()
    }
}

impl SchedulerRegistry {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            databases: Mutex::new(HashMap::new()),
            next_handle_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the scheduler for a named store, creating its entry on first use.
    ///
    /// Must be called from within a Tokio runtime: the first call for a name
    /// spawns that store's queue task.
    pub fn scheduler(self: &Arc<Self>, db_name: &str) -> SchedulerResult<TransactionScheduler> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed(db_name.to_string()));
        }

        let entry = {
            let mut databases = self
                .databases
                .lock()
                .map_err(|_| SchedulerError::Task("registry lock poisoned".to_string()))?;
            databases
                .entry(db_name.to_string())
                .or_insert_with(|| DbEntry::new(db_name, self.db_path(db_name), &self.config))
                .clone()
        };

        Ok(TransactionScheduler::new(self.clone(), entry))
    }

    /// Names of stores with a live entry.
    pub fn database_names(&self) -> Vec<String> {
        self.databases
            .lock()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of open handles for a store.
    pub fn open_handle_count(&self, db_name: &str) -> usize {
        self.databases
            .lock()
            .ok()
            .and_then(|d| d.get(db_name).map(|e| e.handle_count()))
            .unwrap_or(0)
    }

    /// Close every handle and stop every queue. Later calls are rejected.
    pub async fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let entries: Vec<Arc<DbEntry>> = match self.databases.lock() {
            Ok(mut databases) => databases.drain().map(|(_, e)| e).collect(),
            Err(_) => Vec::new(),
        };

        for entry in entries {
            entry.closed.store(true, Ordering::SeqCst);
            entry.close_all_handles().await;
        }
        info!(base_dir = %self.config.base_dir.display(), "Scheduler registry torn down");
    }

    pub(crate) fn next_handle_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::SeqCst)
    }

    fn db_path(&self, db_name: &str) -> PathBuf {
        let file_name: String = db_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.config.base_dir.join(format!("{file_name}.sqlite"))
    }
}

/// Per-name state: open handles plus the FIFO queue.
pub(crate) struct DbEntry {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    handles: Mutex<Vec<DbHandle>>,
    queue: mpsc::UnboundedSender<QueuedTask>,
    task_timeout: Duration,
    pub(crate) closed: AtomicBool,
}

impl DbEntry {
    fn new(name: &str, path: PathBuf, config: &SchedulerConfig) -> Arc<Self> {
        let (queue, mut receiver) = mpsc::unbounded_channel::<QueuedTask>();

        let queue_name = name.to_string();
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    warn!(db = %queue_name, "Queued task panicked, continuing with next task");
                }
            }
            debug!(db = %queue_name, "Task queue stopped");
        });

        Arc::new(Self {
            name: name.to_string(),
            path,
            handles: Mutex::new(Vec::new()),
            queue,
            task_timeout: config.task_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Run `fut` after every previously enqueued task for this store.
    ///
    /// A failing or timed-out task rejects only its own result.
    pub(crate) async fn enqueue<T, Fut>(&self, label: &str, fut: Fut) -> SchedulerResult<T>
    where
        Fut: Future<Output = SchedulerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed(self.name.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let timeout = self.task_timeout;
        let label = label.to_string();
        let db_name = self.name.clone();

        let task: QueuedTask = Box::pin(async move {
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(db = %db_name, task = %label, ?timeout, "Queued task timed out");
                    Err(SchedulerError::Timeout(label, timeout))
                }
            };
            let _ = tx.send(result);
        });

        self.queue
            .send(task)
            .map_err(|_| SchedulerError::Closed(self.name.clone()))?;

        rx.await
            .map_err(|_| SchedulerError::Task(format!("task for {} was dropped", self.name)))?
    }

    pub(crate) fn first_handle(&self) -> Option<DbHandle> {
        self.handles.lock().ok().and_then(|h| h.first().cloned())
    }

    pub(crate) fn register_handle(&self, handle: DbHandle) {
        if let Ok(mut handles) = self.handles.lock() {
            debug!(db = %self.name, handle = handle.id(), "Handle registered");
            handles.push(handle);
        }
    }

    pub(crate) fn remove_handle(&self, id: u64) {
        if let Ok(mut handles) = self.handles.lock() {
            let before = handles.len();
            handles.retain(|h| h.id() != id);
            if handles.len() != before {
                debug!(db = %self.name, handle = id, "Handle deregistered");
            }
        }
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Close every known handle. Work already on a connection thread completes.
    pub(crate) async fn close_all_handles(&self) {
        let handles: Vec<DbHandle> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.close().await;
        }
    }
}
