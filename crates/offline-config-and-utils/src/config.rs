//! Offline channel configuration.

use crate::{ConfigError, ConfigResult, Paths};
use offline_core::{PersistenceLevel, ProviderKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Status codes treated as transient when no explicit list is configured.
pub const DEFAULT_RETRY_CODES: [u16; 8] = [401, 403, 408, 429, 500, 502, 503, 504];

/// Only the first this-many provider preferences are considered.
pub const MAX_PROVIDER_PREFERENCES: usize = 2;

const SEVEN_DAYS_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Offline channel configuration.
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineChannelConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Storage provider preference order.
    pub providers: Vec<ProviderKind>,
    /// Logical database name, combined with a fixed prefix and the endpoint domain.
    pub db_name: String,
    /// Key prefix for blob storage entries.
    pub storage_key_prefix: String,
    /// Root directory for persisted data; platform data dir when unset.
    pub storage_dir: Option<PathBuf>,
    /// Serialized store size ceiling.
    pub max_storage_size_in_bytes: u64,
    /// Persisted events older than this are purged by `clean`.
    pub in_storage_max_time_ms: i64,
    /// Events below this level are never cached offline.
    pub min_persistence_cache_level: PersistenceLevel,
    /// In-memory buffer item limit.
    pub events_limit_in_mem: usize,
    /// Flush timer interval.
    pub in_memo_max_time_ms: u64,
    /// Byte cap of one flushed payload.
    pub max_batch_size_in_bytes: usize,
    /// Keep one in-memory buffer per persistence level.
    pub split_evts: bool,
    /// Send attempts allowed before an item becomes non-retriable.
    pub max_retry: u32,
    /// Explicit retriable status codes; the default set applies when unset.
    pub retry_codes: Option<Vec<u16>>,
    /// Base interval of the send-next-batch timer.
    pub send_base_interval_ms: u64,
    /// Backoff ceiling of the send-next-batch timer.
    pub max_send_batch_interval_ms: u64,
    /// Stored batches sent per timer tick.
    pub send_batch_count: usize,
    /// Entries evicted per eviction round.
    pub events_to_drop_per_time: usize,
    /// Critical entries that may be evicted to make room.
    pub max_critical_evts_drop_cnt: usize,
    /// Run `clean` when a blob provider initializes.
    pub auto_clean: bool,
    /// Sibling sessions idle longer than this are migrated into the active session.
    pub orphan_idle_time_ms: i64,
    /// Scopes idle longer than this are purged entirely.
    pub orphan_retention_time_ms: i64,
    /// Upper bound of entries `clean` removes per call on the blob store.
    pub max_clean_batch: usize,
    /// Minimum gap between aged-entry purges run by the send timer.
    pub clean_interval_ms: u64,
    /// Deadline for one queued database task.
    pub scheduler_task_timeout_ms: u64,
    /// Deadline for one cursor step.
    pub cursor_step_timeout_ms: u64,
}

impl Default for OfflineChannelConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            providers: vec![ProviderKind::Transactional, ProviderKind::Blob],
            db_name: "default".to_string(),
            storage_key_prefix: "OfflineEvents".to_string(),
            storage_dir: None,
            max_storage_size_in_bytes: 5_000_000,
            in_storage_max_time_ms: SEVEN_DAYS_MS,
            min_persistence_cache_level: PersistenceLevel::Normal,
            events_limit_in_mem: 50,
            in_memo_max_time_ms: 15_000,
            max_batch_size_in_bytes: 63_000,
            split_evts: false,
            max_retry: 1,
            retry_codes: None,
            send_base_interval_ms: 15_000,
            max_send_batch_interval_ms: 300_000,
            send_batch_count: 1,
            events_to_drop_per_time: 10,
            max_critical_evts_drop_cnt: 2,
            auto_clean: false,
            orphan_idle_time_ms: 30 * 60 * 1000,
            orphan_retention_time_ms: SEVEN_DAYS_MS,
            max_clean_batch: 20,
            clean_interval_ms: 60_000,
            scheduler_task_timeout_ms: 30_000,
            cursor_step_timeout_ms: 5_000,
        }
    }
}

impl OfflineChannelConfig {
    /// Create a config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the default location, falling back to defaults.
    pub fn load(paths: &Paths) -> ConfigResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OfflineChannelConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> ConfigResult<()> {
        std::fs::create_dir_all(paths.base_dir())?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from `OFFLINE_*` environment variables.
    pub fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("OFFLINE_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(dir) = lookup("OFFLINE_STORAGE_DIR") {
            self.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(bytes) = lookup("OFFLINE_MAX_STORAGE_BYTES").and_then(|v| v.parse().ok()) {
            self.max_storage_size_in_bytes = bytes;
        }
        if let Some(ms) = lookup("OFFLINE_IN_STORAGE_MAX_TIME_MS").and_then(|v| v.parse().ok()) {
            self.in_storage_max_time_ms = ms;
        }
        if let Some(retry) = lookup("OFFLINE_MAX_RETRY").and_then(|v| v.parse().ok()) {
            self.max_retry = retry;
        }
        if let Some(providers) = lookup("OFFLINE_PROVIDERS") {
            let parsed: Vec<ProviderKind> = providers
                .split(',')
                .filter_map(|name| match name.trim().to_ascii_lowercase().as_str() {
                    "transactional" | "sqlite" => Some(ProviderKind::Transactional),
                    "blob" => Some(ProviderKind::Blob),
                    _ => None,
                })
                .collect();
            if !parsed.is_empty() {
                self.providers = parsed;
            }
        }
    }

    /// Reject values that would make timers spin or storage unusable.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_storage_size_in_bytes == 0 {
            return Err(ConfigError::Invalid("max_storage_size_in_bytes must be > 0".to_string()));
        }
        if self.in_memo_max_time_ms == 0 || self.send_base_interval_ms == 0 {
            return Err(ConfigError::Invalid("timer intervals must be > 0".to_string()));
        }
        if self.max_send_batch_interval_ms < self.send_base_interval_ms {
            return Err(ConfigError::Invalid(
                "max_send_batch_interval_ms must be >= send_base_interval_ms".to_string(),
            ));
        }
        if self.events_limit_in_mem == 0 {
            return Err(ConfigError::Invalid("events_limit_in_mem must be > 0".to_string()));
        }
        if self.events_to_drop_per_time == 0 {
            return Err(ConfigError::Invalid("events_to_drop_per_time must be > 0".to_string()));
        }
        if self.providers.contains(&ProviderKind::Custom) {
            return Err(ConfigError::Invalid(
                "custom providers are injected, not listed in providers".to_string(),
            ));
        }
        if let Some(codes) = &self.retry_codes {
            if let Some(code) = codes.iter().find(|c| !(100..=599).contains(*c)) {
                return Err(ConfigError::Invalid(format!("invalid retry status code {code}")));
            }
        }
        Ok(())
    }

    /// Provider preferences actually considered during selection.
    pub fn provider_preferences(&self) -> &[ProviderKind] {
        let len = self.providers.len().min(MAX_PROVIDER_PREFERENCES);
        &self.providers[..len]
    }

    /// Retriable status codes in effect.
    pub fn effective_retry_codes(&self) -> Vec<u16> {
        self.retry_codes
            .clone()
            .unwrap_or_else(|| DEFAULT_RETRY_CODES.to_vec())
    }

    /// Storage root, defaulting to the platform data directory.
    pub fn storage_paths(&self) -> ConfigResult<Paths> {
        match &self.storage_dir {
            Some(dir) => Ok(Paths::with_base_dir(dir.clone())),
            None => Paths::new(),
        }
    }

    pub fn in_memo_max_time(&self) -> Duration {
        Duration::from_millis(self.in_memo_max_time_ms)
    }

    pub fn send_base_interval(&self) -> Duration {
        Duration::from_millis(self.send_base_interval_ms)
    }

    pub fn max_send_batch_interval(&self) -> Duration {
        Duration::from_millis(self.max_send_batch_interval_ms)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_millis(self.clean_interval_ms)
    }

    pub fn scheduler_task_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler_task_timeout_ms)
    }

    pub fn cursor_step_timeout(&self) -> Duration {
        Duration::from_millis(self.cursor_step_timeout_ms)
    }
}
