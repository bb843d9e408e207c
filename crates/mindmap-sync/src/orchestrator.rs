//! Sync orchestrator.
//!
//! Owns the active storage mode, its backend and (in remote mode) the save scheduler.
//! This is the only component that talks to the notification channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mindmap_storage_core::{
    default_document, AppConfig, BackendConfig, DocumentEntry, StorageBackend, StorageError,
    StorageMode, SyncResult, VersionToken,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::document::{DocumentSnapshot, SharedDocument};
use crate::notify::{Notifier, StorageEvent};
use crate::provider::BackendProvider;
use crate::scheduler::{
    update_message, ConflictInfo, ConflictResolution, SaveIntent, SaveScheduler,
    SchedulerEvent, SchedulerHandle, SchedulerSettings,
};
use crate::store::ConfigStore;

struct Session {
    /// Persisted configuration; `config.mode` is the user's choice
    config: AppConfig,
    /// Active mode; differs from `config.mode` after an authentication fallback
    mode: StorageMode,
    backend: Arc<dyn StorageBackend>,
    scheduler: Option<SchedulerHandle>,
    id: u64,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    /// Token held by the last stopped scheduler and the settings it addressed
    parked_token: Option<(BackendConfig, VersionToken)>,
}

impl Session {
    fn events(&self) -> SyncResult<mpsc::UnboundedSender<SchedulerEvent>> {
        self.events
            .clone()
            .ok_or_else(|| StorageError::Invalid("sync orchestrator is shut down".to_string()))
    }

    /// Make `backend` the active one. The previous scheduler must already be shut down.
    fn install(
        &mut self,
        mode: StorageMode,
        backend: Arc<dyn StorageBackend>,
        document: &SharedDocument,
        events: mpsc::UnboundedSender<SchedulerEvent>,
        initial_token: Option<VersionToken>,
    ) {
        self.id += 1;
        self.scheduler = (mode == StorageMode::RemoteVersioned).then(|| {
            SaveScheduler::spawn(
                Arc::clone(&backend),
                document.clone(),
                SchedulerSettings {
                    session: self.id,
                    interval: self.config.remote.timer_interval(),
                    initial_token,
                },
                events,
            )
        });
        self.mode = mode;
        self.backend = backend;
        info!(%mode, session = self.id, "Storage mode active");
    }

    async fn stop_scheduler(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
            self.parked_token = scheduler
                .version_token()
                .map(|token| (self.config.remote.clone(), token));
        }
    }

    /// Version token still valid for a scheduler addressing `remote`.
    fn carried_token(&self, remote: &BackendConfig) -> Option<VersionToken> {
        match &self.scheduler {
            Some(scheduler) if self.config.remote.same_target(remote) => {
                scheduler.version_token()
            }
            Some(_) => None,
            None => self
                .parked_token
                .as_ref()
                .filter(|(addressed, _)| addressed.same_target(remote))
                .map(|(_, token)| token.clone()),
        }
    }
}

struct Shared {
    store: Arc<dyn ConfigStore>,
    provider: Arc<dyn BackendProvider>,
    notifier: Arc<dyn Notifier>,
    document: SharedDocument,
    /// Whether a dirty signal is outstanding
    dirty: AtomicBool,
    session: Mutex<Session>,
}

impl Shared {
    fn surface(&self, error: &StorageError) {
        self.notifier.notify(StorageEvent::error(error));
    }

    fn set_dirty(&self, dirty: bool) {
        if self.dirty.swap(dirty, Ordering::SeqCst) != dirty {
            self.notifier.notify(StorageEvent::DirtyStateChanged(dirty));
        }
    }

    fn clear_dirty_if_clean(&self) {
        if !self.document.is_dirty() {
            self.set_dirty(false);
        }
    }

    async fn on_scheduler_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Saved {
                path,
                version_token,
                ..
            } => {
                self.notifier.notify(StorageEvent::Saved {
                    path,
                    version_token,
                });
                self.clear_dirty_if_clean();
            }
            SchedulerEvent::Failed { session, error } => {
                self.report(session, &error).await;
            }
            SchedulerEvent::Conflict { conflict, .. } => {
                self.surface(&StorageError::Conflict(format!(
                    "{} was changed remotely; overwrite it or discard local changes",
                    conflict.path
                )));
            }
            SchedulerEvent::Adopted { document, .. } => {
                debug!(path = %document.path, "Adopted remote document");
                self.clear_dirty_if_clean();
            }
        }
    }

    /// Surface `error`; rejected credentials also end remote mode for `session_id`.
    async fn report(&self, session_id: u64, error: &StorageError) {
        self.surface(error);
        if matches!(error, StorageError::AuthFailure(_)) {
            self.fall_back_to_local(session_id).await;
        }
    }

    /// Switch the running session to local storage without touching the persisted mode.
    async fn fall_back_to_local(&self, session_id: u64) {
        let mut session = self.session.lock().await;
        if session.id != session_id || session.mode != StorageMode::RemoteVersioned {
            return;
        }

        let local = match self
            .provider
            .backend(StorageMode::Local, &session.config.remote)
        {
            Ok(local) => local,
            Err(e) => {
                warn!("Cannot fall back to local storage: {}", e);
                return;
            }
        };
        let Ok(events) = session.events() else {
            return;
        };

        warn!("Remote credentials rejected, falling back to local storage");
        session.stop_scheduler().await;
        session.install(StorageMode::Local, local, &self.document, events, None);
    }
}

async fn forward_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
    while let Some(event) = events.recv().await {
        shared.on_scheduler_event(event).await;
    }
    debug!("Scheduler event stream closed");
}

/// Build the backend for `mode`, checking remote access before it is used.
async fn activate(
    provider: &dyn BackendProvider,
    mode: StorageMode,
    remote: &BackendConfig,
) -> SyncResult<Arc<dyn StorageBackend>> {
    if mode == StorageMode::RemoteVersioned {
        remote.require_remote()?;
    }
    let backend = provider.backend(mode, remote)?;
    if mode == StorageMode::RemoteVersioned {
        backend.check_access().await?;
    }
    Ok(backend)
}

/// Entry point for the editor: load, persist and configure document storage.
pub struct SyncOrchestrator {
    shared: Arc<Shared>,
    forwarder: JoinHandle<()>,
}

impl SyncOrchestrator {
    /// Read the persisted configuration and activate its storage mode.
    ///
    /// If remote access cannot be established the error is surfaced and the session
    /// starts in local mode; the persisted mode is left as it was.
    #[instrument(skip_all, level = "debug")]
    pub async fn start(
        store: Arc<dyn ConfigStore>,
        provider: Arc<dyn BackendProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> SyncResult<Self> {
        let config = store.load()?;
        config.remote.validate()?;

        let (mode, backend) = match activate(provider.as_ref(), config.mode, &config.remote).await
        {
            Ok(backend) => (config.mode, backend),
            Err(e) if config.mode != StorageMode::Local => {
                warn!(mode = %config.mode, "Cannot activate storage mode: {}", e);
                notifier.notify(StorageEvent::error(&e));
                let local = provider.backend(StorageMode::Local, &config.remote)?;
                (StorageMode::Local, local)
            }
            Err(e) => return Err(e),
        };

        let document =
            SharedDocument::new(config.remote.path.clone(), default_document().to_string());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            config,
            mode,
            backend: Arc::clone(&backend),
            scheduler: None,
            id: 0,
            events: Some(events_tx.clone()),
            parked_token: None,
        };
        session.install(mode, backend, &document, events_tx, None);

        let shared = Arc::new(Shared {
            store,
            provider,
            notifier,
            document,
            dirty: AtomicBool::new(false),
            session: Mutex::new(session),
        });
        let forwarder = tokio::spawn(forward_events(Arc::clone(&shared), events_rx));

        Ok(Self { shared, forwarder })
    }

    /// Load the current document.
    ///
    /// Never fails: a missing document yields the built-in default silently, any other
    /// failure is surfaced and also yields the default.
    #[instrument(skip(self), level = "debug")]
    pub async fn load_document(&self) -> Value {
        let (backend, scheduler, path, session_id) = {
            let session = self.shared.session.lock().await;
            (
                Arc::clone(&session.backend),
                session.scheduler.clone(),
                session.config.remote.path.clone(),
                session.id,
            )
        };

        let result = match &scheduler {
            Some(scheduler) => scheduler.load(&path).await,
            None => backend.get(&path).await,
        };

        let loaded = match result {
            Ok(document) => match serde_json::from_str::<Value>(&document.content) {
                Ok(value) => {
                    if scheduler.is_none() {
                        self.shared.document.load(&path, document.content);
                    }
                    Some(value)
                }
                Err(e) => {
                    self.shared.surface(&StorageError::Encoding(format!(
                        "{} is not a valid mind map: {}",
                        path, e
                    )));
                    None
                }
            },
            Err(e) if e.is_not_found() => {
                debug!(%path, "No stored document yet, using the default");
                None
            }
            Err(e) => {
                warn!(%path, "Failed to load document: {}", e);
                self.shared.report(session_id, &e).await;
                None
            }
        };

        let value = match loaded {
            Some(value) => value,
            None => {
                let fallback = default_document();
                self.shared
                    .document
                    .load(&path, fallback.to_string());
                fallback
            }
        };
        self.shared.set_dirty(false);
        value
    }

    /// Shallow-merge `patch` into the last-known document and persist it per mode.
    ///
    /// Local and host-managed modes write synchronously. Remote mode submits an auto save
    /// when auto-save is on, otherwise it holds the change and raises the dirty signal.
    #[instrument(skip(self, patch), level = "debug")]
    pub async fn persist_document(&self, patch: Value) -> SyncResult<()> {
        let Value::Object(patch) = patch else {
            return Err(StorageError::Invalid(
                "document patch must be a JSON object".to_string(),
            ));
        };

        let snapshot = self.shared.document.edit_with(|current| {
            let mut merged = match serde_json::from_str::<Value>(current) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            merged.extend(patch);
            Value::Object(merged).to_string()
        });

        let (backend, scheduler, auto_save) = {
            let session = self.shared.session.lock().await;
            (
                Arc::clone(&session.backend),
                session.scheduler.clone(),
                session.config.remote.auto_save,
            )
        };

        match scheduler {
            Some(scheduler) if auto_save => {
                scheduler.request_save(SaveIntent::Auto);
                Ok(())
            }
            Some(_) => {
                self.shared.set_dirty(true);
                Ok(())
            }
            None => {
                match backend
                    .put(&snapshot.path, &snapshot.content, &update_message(), None)
                    .await
                {
                    Ok(version_token) => {
                        self.shared.document.mark_saved(snapshot.generation);
                        self.shared.notifier.notify(StorageEvent::Saved {
                            path: snapshot.path,
                            version_token,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        self.shared.surface(&e);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Manual save of the current snapshot.
    #[instrument(skip(self), level = "debug")]
    pub async fn save_now(&self) -> SyncResult<Option<VersionToken>> {
        let (backend, scheduler) = {
            let session = self.shared.session.lock().await;
            (Arc::clone(&session.backend), session.scheduler.clone())
        };

        if let Some(scheduler) = scheduler {
            // Failures reach the notifier through the scheduler's events.
            return scheduler.save_now().await;
        }

        let snapshot = self.shared.document.snapshot();
        match backend
            .put(&snapshot.path, &snapshot.content, &update_message(), None)
            .await
        {
            Ok(version_token) => {
                self.shared.document.mark_saved(snapshot.generation);
                self.shared.notifier.notify(StorageEvent::Saved {
                    path: snapshot.path,
                    version_token: version_token.clone(),
                });
                self.shared.clear_dirty_if_clean();
                Ok(version_token)
            }
            Err(e) => {
                self.shared.surface(&e);
                Err(e)
            }
        }
    }

    /// Apply the caller's decision to an unresolved conflict.
    pub async fn resolve_conflict(
        &self,
        resolution: ConflictResolution,
    ) -> SyncResult<Option<VersionToken>> {
        let scheduler = self.shared.session.lock().await.scheduler.clone();
        match scheduler {
            Some(scheduler) => scheduler.resolve_conflict(resolution).await,
            None => Err(StorageError::Invalid("no unresolved conflict".to_string())),
        }
    }

    /// Switch storage mode and persist the choice.
    ///
    /// The new backend is checked before anything changes; on failure the current mode
    /// stays active. The old timer is cancelled and any in-flight write completes before
    /// the new mode takes over.
    #[instrument(skip(self), level = "debug")]
    pub async fn set_mode(&self, mode: StorageMode) -> SyncResult<()> {
        let mut session = self.shared.session.lock().await;
        if session.mode == mode && session.config.mode == mode {
            return Ok(());
        }

        let result = self.switch_mode(&mut session, mode).await;
        if let Err(e) = &result {
            warn!(%mode, "Cannot switch storage mode: {}", e);
            self.shared.surface(e);
        }
        result
    }

    /// Replace the remote settings and persist them.
    ///
    /// Connection changes rebuild the remote backend and scheduler; auto-save changes
    /// only restart the timer. A changed `path` takes effect on the next load.
    #[instrument(skip(self, remote), level = "debug")]
    pub async fn update_config(&self, remote: BackendConfig) -> SyncResult<()> {
        remote.validate()?;

        let mut session = self.shared.session.lock().await;
        let mut config = session.config.clone();
        let connection_changed = !config.remote.same_connection(&remote);
        config.remote = remote;

        let result = self.apply_config(&mut session, config, connection_changed).await;
        if let Err(e) = &result {
            self.shared.surface(e);
        }
        result
    }

    async fn switch_mode(&self, session: &mut Session, mode: StorageMode) -> SyncResult<()> {
        let events = session.events()?;
        let backend = activate(self.shared.provider.as_ref(), mode, &session.config.remote).await?;

        let mut config = session.config.clone();
        config.mode = mode;
        self.shared.store.save(&config)?;
        session.config = config;

        session.stop_scheduler().await;
        let token = session.carried_token(&session.config.remote);
        session.install(mode, backend, &self.shared.document, events, token);
        Ok(())
    }

    async fn apply_config(
        &self,
        session: &mut Session,
        config: AppConfig,
        connection_changed: bool,
    ) -> SyncResult<()> {
        let rebuild = config.mode == StorageMode::RemoteVersioned
            && (connection_changed || session.mode != StorageMode::RemoteVersioned);

        if rebuild {
            let events = session.events()?;
            let backend = activate(
                self.shared.provider.as_ref(),
                StorageMode::RemoteVersioned,
                &config.remote,
            )
            .await?;
            self.shared.store.save(&config)?;
            // Credential or timeout changes keep addressing the same object.
            let token = session.carried_token(&config.remote);
            session.stop_scheduler().await;
            session.config = config;
            session.install(
                StorageMode::RemoteVersioned,
                backend,
                &self.shared.document,
                events,
                token,
            );
            return Ok(());
        }

        self.shared.store.save(&config)?;
        let interval = config.remote.timer_interval();
        let auto_save = config.remote.auto_save;
        session.config = config;
        if let Some(scheduler) = &session.scheduler {
            scheduler.reconfigure(interval);
            if auto_save && self.shared.document.is_dirty() {
                scheduler.request_save(SaveIntent::Auto);
            }
        }
        Ok(())
    }

    /// List documents in `directory` of the active backend.
    pub async fn list_documents(&self, directory: &str) -> SyncResult<Vec<DocumentEntry>> {
        let (backend, session_id) = {
            let session = self.shared.session.lock().await;
            (Arc::clone(&session.backend), session.id)
        };
        let result = backend.list(directory).await;
        if let Err(e) = &result {
            self.shared.report(session_id, e).await;
        }
        result
    }

    /// Delete a document from the remote host.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_document(&self, path: &str) -> SyncResult<()> {
        let (mode, scheduler, session_id) = {
            let session = self.shared.session.lock().await;
            (session.mode, session.scheduler.clone(), session.id)
        };

        let result = match scheduler {
            Some(scheduler) => scheduler.delete(path).await,
            None => Err(StorageError::Unsupported(format!(
                "documents cannot be deleted in {} mode",
                mode
            ))),
        };
        if let Err(e) = &result {
            self.shared.report(session_id, e).await;
        }
        result
    }

    /// Active storage mode.
    pub async fn mode(&self) -> StorageMode {
        self.shared.session.lock().await.mode
    }

    /// Persisted configuration.
    pub async fn config(&self) -> AppConfig {
        self.shared.session.lock().await.config.clone()
    }

    /// Version token of the current document, for display only.
    pub async fn version_token(&self) -> Option<VersionToken> {
        let session = self.shared.session.lock().await;
        session.scheduler.as_ref().and_then(|s| s.version_token())
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.document.is_dirty()
    }

    pub async fn pending_conflict(&self) -> Option<ConflictInfo> {
        let session = self.shared.session.lock().await;
        session.scheduler.as_ref().and_then(|s| s.pending_conflict())
    }

    pub fn subscribe_document(&self) -> watch::Receiver<DocumentSnapshot> {
        self.shared.document.subscribe()
    }

    /// Stop the timer, let any in-flight write finish and release the backend.
    #[instrument(skip(self), level = "debug")]
    pub async fn shutdown(self) {
        {
            let mut session = self.shared.session.lock().await;
            session.stop_scheduler().await;
            session.events = None;
        }
        let _ = self.forwarder.await;
        info!("Sync orchestrator stopped");
    }
}
