use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use mindmap_storage_core::{AppConfig, BackendConfig, StorageMode, SyncResult};
use mindmap_sync::{ConfigStore, JsonFileConfigStore};

/// Configuration for the mindmap-sync command-line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "mindmap-sync")]
#[command(about = "Load, save and synchronise mind map documents")]
pub struct Config {
    /// Configuration file (default: <config dir>/mindmap-sync/config.json)
    #[arg(long, env = "MINDMAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Remote access token; overrides the stored token for this run
    #[arg(long, env = "MINDMAP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Root directory for local documents (default: <data dir>/mindmap-sync/documents)
    #[arg(long, env = "MINDMAP_LOCAL_DIR")]
    pub local_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the current document
    Load,
    /// Merge a JSON object into the current document and save it
    Save {
        /// Top-level keys replace those of the stored document
        patch: Option<String>,
    },
    /// List documents in a remote directory
    List {
        #[arg(default_value = "")]
        directory: String,
    },
    /// Delete a remote document
    Delete { path: String },
    /// Check remote credentials and repository access
    Check,
    /// Switch the storage mode
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Update remote settings
    Configure(ConfigureArgs),
    /// Print the stored configuration
    Show,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Local,
    Remote,
    Host,
}

impl From<ModeArg> for StorageMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Local => StorageMode::Local,
            ModeArg::Remote => StorageMode::RemoteVersioned,
            ModeArg::Host => StorageMode::HostManaged,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigureArgs {
    #[arg(long)]
    pub owner: Option<String>,

    #[arg(long)]
    pub repo: Option<String>,

    #[arg(long)]
    pub branch: Option<String>,

    /// Document path inside the repository
    #[arg(long)]
    pub path: Option<String>,

    #[arg(long)]
    pub auto_save: Option<bool>,

    /// Auto-save interval (seconds)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Request timeout (seconds)
    #[arg(long)]
    pub timeout: Option<u64>,

    #[arg(long)]
    pub api_base: Option<String>,

    /// Store the --token value in the configuration file
    #[arg(long)]
    pub save_token: bool,
}

impl ConfigureArgs {
    pub fn apply(&self, remote: &mut BackendConfig, token: Option<&str>) {
        if let Some(owner) = &self.owner {
            remote.owner = owner.clone();
        }
        if let Some(repo) = &self.repo {
            remote.repo = repo.clone();
        }
        if let Some(branch) = &self.branch {
            remote.branch = branch.clone();
        }
        if let Some(path) = &self.path {
            remote.path = path.clone();
        }
        if let Some(auto_save) = self.auto_save {
            remote.auto_save = auto_save;
        }
        if let Some(interval) = self.interval {
            remote.auto_save_interval_secs = interval;
        }
        if let Some(timeout) = self.timeout {
            remote.request_timeout_secs = timeout;
        }
        if let Some(api_base) = &self.api_base {
            remote.api_base = api_base.clone();
        }
        if let (true, Some(token)) = (self.save_token, token) {
            remote.token = token.to_string();
        }
    }
}

/// JSON file store that layers the command-line token over the stored one.
///
/// The overriding token is only written back when `persist_token` is set.
pub struct CliConfigStore {
    inner: JsonFileConfigStore,
    token: Option<String>,
    persist_token: bool,
}

impl CliConfigStore {
    pub fn new(inner: JsonFileConfigStore, token: Option<String>, persist_token: bool) -> Self {
        Self {
            inner,
            token,
            persist_token,
        }
    }
}

impl ConfigStore for CliConfigStore {
    fn load(&self) -> SyncResult<AppConfig> {
        let mut config = self.inner.load()?;
        if let Some(token) = &self.token {
            config.remote.token = token.clone();
        }
        Ok(config)
    }

    fn save(&self, config: &AppConfig) -> SyncResult<()> {
        match &self.token {
            Some(token) if !self.persist_token && config.remote.token == *token => {
                let mut stored = config.clone();
                stored.remote.token = self.inner.load()?.remote.token;
                self.inner.save(&stored)
            }
            _ => self.inner.save(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_configure() {
        let config = Config::try_parse_from([
            "mindmap-sync",
            "--token",
            "ghp_cli",
            "configure",
            "--owner",
            "alice",
            "--auto-save",
            "false",
            "--interval",
            "15",
        ])
        .unwrap();

        let Command::Configure(args) = config.command else {
            panic!("expected configure");
        };
        let mut remote = BackendConfig::default();
        args.apply(&mut remote, config.token.as_deref());

        assert_eq!(remote.owner, "alice");
        assert!(!remote.auto_save);
        assert_eq!(remote.auto_save_interval_secs, 15);
        // Not persisted without --save-token.
        assert!(remote.token.is_empty());
    }

    #[test]
    fn test_parse_mode() {
        let config = Config::try_parse_from(["mindmap-sync", "mode", "remote"]).unwrap();
        let Command::Mode { mode } = config.command else {
            panic!("expected mode");
        };
        assert_eq!(StorageMode::from(mode), StorageMode::RemoteVersioned);
    }

    #[test]
    fn test_token_override_is_not_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let inner = JsonFileConfigStore::new(temp_dir.path().join("config.json"));
        let mut stored = AppConfig::default();
        stored.remote.token = "ghp_stored".into();
        inner.save(&stored).unwrap();

        let store = CliConfigStore::new(inner.clone(), Some("ghp_cli".into()), false);
        let mut config = store.load().unwrap();
        assert_eq!(config.remote.token, "ghp_cli");

        config.remote.owner = "alice".into();
        store.save(&config).unwrap();

        let on_disk = inner.load().unwrap();
        assert_eq!(on_disk.remote.token, "ghp_stored");
        assert_eq!(on_disk.remote.owner, "alice");
    }

    #[test]
    fn test_token_persisted_on_request() {
        let temp_dir = TempDir::new().unwrap();
        let inner = JsonFileConfigStore::new(temp_dir.path().join("config.json"));
        let store = CliConfigStore::new(inner.clone(), Some("ghp_cli".into()), true);

        let config = store.load().unwrap();
        store.save(&config).unwrap();
        assert_eq!(inner.load().unwrap().remote.token, "ghp_cli");
    }
}
