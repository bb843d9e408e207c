mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mindmap_storage_core::{
    BackendConfig, LocalBackend, StorageBackend, StorageError, StorageMode, SyncResult,
};
use mindmap_storage_github::GitHubBackend;
use mindmap_storage_local::LocalFileStore;
use mindmap_sync::{
    BackendProvider, ConfigStore, JsonFileConfigStore, SyncOrchestrator, TracingNotifier,
};
use serde_json::Value;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{CliConfigStore, Command, Config};

/// Backends available from the command line.
struct CliBackends {
    local: Arc<LocalFileStore>,
}

impl BackendProvider for CliBackends {
    fn backend(
        &self,
        mode: StorageMode,
        config: &BackendConfig,
    ) -> SyncResult<Arc<dyn StorageBackend>> {
        match mode {
            StorageMode::Local => {
                self.local.open(&config.path)?;
                Ok(Arc::new(LocalBackend::new(self.local.clone())))
            }
            StorageMode::RemoteVersioned => Ok(Arc::new(GitHubBackend::from_config(config)?)),
            StorageMode::HostManaged => Err(StorageError::Unsupported(
                "host-managed storage needs an embedding host application".to_string(),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries documents.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    let config_path = match &config.config {
        Some(path) => path.clone(),
        None => JsonFileConfigStore::default_path()?,
    };
    let persist_token = matches!(&config.command, Command::Configure(args) if args.save_token);
    let store = Arc::new(CliConfigStore::new(
        JsonFileConfigStore::new(&config_path),
        config.token.clone(),
        persist_token,
    ));
    info!("Configuration: {}", config_path.display());

    if let Command::Check = config.command {
        return check(store.as_ref()).await;
    }

    let local_root = match &config.local_dir {
        Some(dir) => dir.clone(),
        None => LocalFileStore::default_root()?,
    };
    info!("Local documents: {}", local_root.display());
    let provider = Arc::new(CliBackends {
        local: Arc::new(LocalFileStore::new(local_root)),
    });

    let orchestrator = SyncOrchestrator::start(store, provider, Arc::new(TracingNotifier)).await?;
    info!("Storage mode: {}", orchestrator.mode().await);

    // An interrupt abandons the command but never an in-flight write: shutdown below
    // waits for it.
    let mut shutdown_rx = create_shutdown_signal();
    let result = tokio::select! {
        result = run(&orchestrator, &config) => result,
        _ = shutdown_rx.wait_for(|&v| v) => Ok(()),
    };

    orchestrator.shutdown().await;
    result
}

async fn run(orchestrator: &SyncOrchestrator, config: &Config) -> anyhow::Result<()> {
    match &config.command {
        Command::Load => {
            let document = orchestrator.load_document().await;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        Command::Save { patch } => {
            orchestrator.load_document().await;
            if let Some(patch) = patch {
                let patch: Value =
                    serde_json::from_str(patch).context("patch is not valid JSON")?;
                orchestrator.persist_document(patch).await?;
            }
            // Local and host-managed writes already happened synchronously.
            if patch.is_none() || orchestrator.mode().await == StorageMode::RemoteVersioned {
                let token = orchestrator.save_now().await?;
                match token {
                    Some(token) => println!("Saved (version {})", token),
                    None => println!("Saved"),
                }
            } else {
                println!("Saved");
            }
        }
        Command::List { directory } => {
            for entry in orchestrator.list_documents(directory).await? {
                println!(
                    "{:<40} {:>10}  {}",
                    entry.path, entry.size, entry.version_token
                );
            }
        }
        Command::Delete { path } => {
            orchestrator.delete_document(path).await?;
            println!("Deleted {}", path);
        }
        Command::Mode { mode } => {
            orchestrator.set_mode((*mode).into()).await?;
            println!("Storage mode: {}", orchestrator.mode().await);
        }
        Command::Configure(args) => {
            let mut remote = orchestrator.config().await.remote;
            args.apply(&mut remote, config.token.as_deref());
            orchestrator.update_config(remote).await?;
            println!("Configuration updated");
        }
        Command::Show => {
            let mut stored = orchestrator.config().await;
            if !stored.remote.token.is_empty() {
                stored.remote.token = "********".to_string();
            }
            println!("{}", serde_json::to_string_pretty(&stored)?);
            println!("Active mode: {}", orchestrator.mode().await);
            if let Some(token) = orchestrator.version_token().await {
                println!("Version: {}", token);
            }
        }
        // Runs before a session is started.
        Command::Check => {}
    }
    Ok(())
}

/// Check remote credentials without starting a session.
async fn check(store: &dyn ConfigStore) -> anyhow::Result<()> {
    let remote = store.load()?.remote;
    let backend = GitHubBackend::from_config(&remote)?;
    backend.check_access().await?;
    println!(
        "Remote access OK: {}/{} ({})",
        remote.owner, remote.repo, remote.branch
    );
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C, shutting down");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
            info!("Received SIGTERM, shutting down");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
