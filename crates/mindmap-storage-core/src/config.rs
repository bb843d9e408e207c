use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::{StorageMode, DEFAULT_DOCUMENT_PATH};
use crate::error::{StorageError, SyncResult};

/// Settings for the remote, version-controlled backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Bearer token sent on every remote call
    pub token: String,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    pub branch: String,
    /// Path of the current document inside the repository
    pub path: String,
    pub auto_save: bool,
    /// Auto-save period in whole seconds (>= 1)
    pub auto_save_interval_secs: u64,
    /// Per-request timeout in whole seconds (>= 1)
    pub request_timeout_secs: u64,
    /// Base URL of the contents API
    pub api_base: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            owner: String::new(),
            repo: String::new(),
            branch: "main".to_string(),
            path: DEFAULT_DOCUMENT_PATH.to_string(),
            auto_save: true,
            auto_save_interval_secs: 60,
            request_timeout_secs: 30,
            api_base: "https://api.github.com".to_string(),
        }
    }
}

impl BackendConfig {
    /// Check value bounds.
    pub fn validate(&self) -> SyncResult<()> {
        if self.auto_save_interval_secs < 1 {
            return Err(StorageError::Config(
                "auto-save interval must be at least 1 second".to_string(),
            ));
        }
        if self.request_timeout_secs < 1 {
            return Err(StorageError::Config(
                "request timeout must be at least 1 second".to_string(),
            ));
        }
        if self.path.trim().is_empty() {
            return Err(StorageError::Config("document path is empty".to_string()));
        }
        Ok(())
    }

    /// Check that everything needed to reach the remote host is present.
    pub fn require_remote(&self) -> SyncResult<()> {
        self.validate()?;
        for (name, value) in [
            ("token", &self.token),
            ("owner", &self.owner),
            ("repo", &self.repo),
            ("branch", &self.branch),
        ] {
            if value.trim().is_empty() {
                return Err(StorageError::Config(format!("remote {} is not set", name)));
            }
        }
        Ok(())
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Interval the save timer should run at, `None` when auto-save is off.
    pub fn timer_interval(&self) -> Option<Duration> {
        self.auto_save.then(|| self.auto_save_interval())
    }

    /// Whether two configs address the same remote object, whatever the credentials.
    pub fn same_target(&self, other: &BackendConfig) -> bool {
        self.owner == other.owner
            && self.repo == other.repo
            && self.branch == other.branch
            && self.path == other.path
            && self.api_base == other.api_base
    }

    /// Whether two configs address the same remote object through the same connection.
    pub fn same_connection(&self, other: &BackendConfig) -> bool {
        self.token == other.token
            && self.owner == other.owner
            && self.repo == other.repo
            && self.branch == other.branch
            && self.path == other.path
            && self.api_base == other.api_base
            && self.request_timeout_secs == other.request_timeout_secs
    }
}

/// The single persisted configuration record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: StorageMode,
    pub remote: BackendConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> BackendConfig {
        BackendConfig {
            token: "ghp_test".into(),
            owner: "alice".into(),
            repo: "maps".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.branch, "main");
        assert_eq!(config.path, "mindmap.smm");
        assert!(config.auto_save);
        assert_eq!(config.auto_save_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = BackendConfig {
            auto_save_interval_secs: 0,
            ..remote()
        };
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_require_remote() {
        assert!(remote().require_remote().is_ok());
        let missing = BackendConfig {
            token: String::new(),
            ..remote()
        };
        let err = missing.require_remote().unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_timer_interval() {
        let mut config = remote();
        config.auto_save_interval_secs = 5;
        assert_eq!(config.timer_interval(), Some(Duration::from_secs(5)));
        config.auto_save = false;
        assert_eq!(config.timer_interval(), None);
    }

    #[test]
    fn test_same_connection_ignores_auto_save() {
        let a = remote();
        let b = BackendConfig {
            auto_save: false,
            auto_save_interval_secs: 10,
            ..remote()
        };
        assert!(a.same_connection(&b));
        let c = BackendConfig {
            branch: "dev".into(),
            ..remote()
        };
        assert!(!a.same_connection(&c));
    }

    #[test]
    fn test_token_rotation_keeps_target() {
        let a = remote();
        let b = BackendConfig {
            token: "ghp_rotated".into(),
            request_timeout_secs: 5,
            ..remote()
        };
        assert!(!a.same_connection(&b));
        assert!(a.same_target(&b));
        let c = BackendConfig {
            path: "maps/other.smm".into(),
            ..remote()
        };
        assert!(!a.same_target(&c));
    }

    #[test]
    fn test_partial_record_deserializes() {
        let config: AppConfig =
            serde_json::from_str(r#"{"mode":"remote_versioned","remote":{"owner":"bob"}}"#)
                .unwrap();
        assert_eq!(config.mode, StorageMode::RemoteVersioned);
        assert_eq!(config.remote.owner, "bob");
        assert_eq!(config.remote.branch, "main");
    }
}
