//! Persisted configuration record.
//!
//! Read once at startup and rewritten wholesale on every change.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use mindmap_storage_core::{AppConfig, StorageError, SyncResult};
use tracing::{debug, instrument};

/// Where the configuration record lives.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> SyncResult<AppConfig>;

    fn save(&self, config: &AppConfig) -> SyncResult<()>;
}

/// JSON file store, `<config dir>/mindmap-sync/config.json` by default.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> SyncResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("mindmap-sync").join("config.json"))
            .ok_or_else(|| {
                StorageError::Config("no configuration directory for this platform".to_string())
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileConfigStore {
    #[instrument(skip(self), level = "debug", fields(path = %self.path.display()))]
    fn load(&self) -> SyncResult<AppConfig> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", self.path.display());
                return Ok(AppConfig::default());
            }
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&raw).map_err(|e| {
            StorageError::Config(format!("Invalid configuration in {}: {}", self.path.display(), e))
        })
    }

    #[instrument(skip(self, config), level = "debug", fields(path = %self.path.display()))]
    fn save(&self, config: &AppConfig) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::Io(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let json = serde_json::to_string_pretty(config)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(|e| {
            StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &self.path).map_err(|e| {
            StorageError::Io(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

/// In-memory store for tests and embedders that persist configuration themselves.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<AppConfig>,
    saves: Mutex<usize>,
}

impl MemoryConfigStore {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: Mutex::new(0),
        }
    }

    pub fn current(&self) -> AppConfig {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of times the record was rewritten.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> SyncResult<AppConfig> {
        Ok(self.current())
    }

    fn save(&self, config: &AppConfig) -> SyncResult<()> {
        *self
            .config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config.clone();
        *self.saves.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }
}
