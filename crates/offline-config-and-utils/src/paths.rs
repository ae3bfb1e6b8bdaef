//! File system locations used by the offline channel.

use crate::{ConfigError, ConfigResult};
use std::path::PathBuf;

const APP_DIR_NAME: &str = "offline-channel";
const CONFIG_FILE_NAME: &str = "config.json";

/// Manages file system paths for persisted telemetry.
#[derive(Debug, Clone)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    /// Use the platform local data directory (e.g. `~/.local/share/offline-channel`).
    pub fn new() -> ConfigResult<Self> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| ConfigError::Path("Could not determine local data directory".to_string()))?;

        Ok(Self {
            base_dir: data_dir.join(APP_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Directory holding SQLite stores.
    pub fn database_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    /// Directory holding key-value blobs.
    pub fn blob_dir(&self) -> PathBuf {
        self.base_dir.join("blobs")
    }

    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE_NAME)
    }

    /// Ensure all directories exist.
    pub fn ensure_dirs(&self) -> ConfigResult<()> {
        std::fs::create_dir_all(self.database_dir())?;
        std::fs::create_dir_all(self.blob_dir())?;
        Ok(())
    }
}
