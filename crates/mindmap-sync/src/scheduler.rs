//! Save scheduler.
//!
//! A single actor task owns the remote version token, the auto-save timer and the one
//! outstanding backend call. Everything else talks to it through a cloneable
//! [`SchedulerHandle`], so at most one `put`/`delete` can ever be in flight.

use std::collections::VecDeque;
use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use mindmap_storage_core::{Document, StorageBackend, StorageError, SyncResult, VersionToken};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::document::SharedDocument;

type SaveReply = oneshot::Sender<SyncResult<Option<VersionToken>>>;

/// Why a save was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveIntent {
    /// Timer or edit driven; dropped while a write is in flight.
    Auto,
    /// User driven; queued (at most one) while a write is in flight.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// A backend call is in flight.
    Saving,
    /// A write was rejected as stale and the remote version is being re-fetched.
    PendingRetry,
}

/// Caller decision for an unresolved conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Write the local snapshot on top of the re-fetched remote version.
    Overwrite,
    /// Drop local changes and adopt the re-fetched remote document.
    DiscardLocal,
}

/// A rejected write waiting for a caller decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub path: String,
    /// Remote document as re-fetched after the rejection; `None` if it could not be read.
    pub remote: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Tags every event so stale events from a replaced scheduler can be ignored
    pub session: u64,
    /// Auto-save period; `None` disables the timer
    pub interval: Option<Duration>,
    /// Version token already known for the current document
    pub initial_token: Option<VersionToken>,
}

/// Outcome reported to the owner of the scheduler. The scheduler never notifies the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Saved {
        session: u64,
        path: String,
        generation: u64,
        version_token: Option<VersionToken>,
    },
    Failed {
        session: u64,
        error: StorageError,
    },
    Conflict {
        session: u64,
        conflict: ConflictInfo,
    },
    Adopted {
        session: u64,
        document: Document,
    },
}

enum Command {
    Save {
        intent: SaveIntent,
        reply: Option<SaveReply>,
    },
    Load {
        path: String,
        reply: oneshot::Sender<SyncResult<Document>>,
    },
    Delete {
        path: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Resolve {
        resolution: ConflictResolution,
        reply: SaveReply,
    },
    Reconfigure(Option<Duration>),
    Shutdown(oneshot::Sender<()>),
}

impl Command {
    fn reject(self, error: StorageError) {
        match self {
            Command::Save { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(error));
                }
            }
            Command::Load { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Delete { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Resolve { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Reconfigure(_) => {}
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

enum Completion {
    Write {
        path: String,
        generation: u64,
        result: SyncResult<Option<VersionToken>>,
        waiters: Vec<SaveReply>,
    },
    Refetch {
        path: String,
        error: StorageError,
        result: SyncResult<Document>,
        waiters: Vec<SaveReply>,
    },
    Load {
        path: String,
        result: SyncResult<Document>,
        reply: oneshot::Sender<SyncResult<Document>>,
    },
    Delete {
        path: String,
        result: SyncResult<()>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
}

/// Commit message for a document write.
pub(crate) fn update_message() -> String {
    format!("Update mind map {}", Utc::now().to_rfc3339())
}

fn not_running() -> StorageError {
    StorageError::Invalid("save scheduler is not running".to_string())
}

/// Handle to a running scheduler. Requests are queued when the method is called, so
/// requests made from one handle reach the scheduler in call order.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    token: watch::Receiver<Option<VersionToken>>,
    state: watch::Receiver<SchedulerState>,
    conflict: watch::Receiver<Option<ConflictInfo>>,
}

impl SchedulerHandle {
    /// Fire-and-forget save request.
    pub fn request_save(&self, intent: SaveIntent) {
        let _ = self.tx.send(Command::Save {
            intent,
            reply: None,
        });
    }

    /// Manual save that resolves once a write covering the current snapshot completes.
    pub fn save_now(
        &self,
    ) -> impl Future<Output = SyncResult<Option<VersionToken>>> + Send + 'static {
        self.call(|reply| Command::Save {
            intent: SaveIntent::Manual,
            reply: Some(reply),
        })
    }

    /// Fetch `path`, record its version token and replace the shared snapshot with it.
    pub fn load(&self, path: &str) -> impl Future<Output = SyncResult<Document>> + Send + 'static {
        let path = path.to_string();
        self.call(|reply| Command::Load { path, reply })
    }

    /// Delete `path`, fetching its version token first when the scheduler does not hold it.
    pub fn delete(&self, path: &str) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        let path = path.to_string();
        self.call(|reply| Command::Delete { path, reply })
    }

    pub fn resolve_conflict(
        &self,
        resolution: ConflictResolution,
    ) -> impl Future<Output = SyncResult<Option<VersionToken>>> + Send + 'static {
        self.call(move |reply| Command::Resolve { resolution, reply })
    }

    fn call<T: Send + 'static>(
        &self,
        command: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command,
    ) -> impl Future<Output = SyncResult<T>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(command(reply)).is_ok();
        async move {
            if !sent {
                return Err(not_running());
            }
            rx.await.unwrap_or_else(|_| Err(not_running()))
        }
    }

    /// Replace the auto-save timer. The old timer is cancelled before the new one starts.
    pub fn reconfigure(&self, interval: Option<Duration>) {
        let _ = self.tx.send(Command::Reconfigure(interval));
    }

    /// Cancel the timer, wait for the in-flight call (if any) and stop.
    ///
    /// Requests still queued at that point fail with `StorageError::Invalid`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Version token of the current document as last confirmed by a get or put.
    pub fn version_token(&self) -> Option<VersionToken> {
        self.token.borrow().clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn pending_conflict(&self) -> Option<ConflictInfo> {
        self.conflict.borrow().clone()
    }
}

pub struct SaveScheduler {
    backend: Arc<dyn StorageBackend>,
    document: SharedDocument,
    session: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    token: watch::Sender<Option<VersionToken>>,
    state: watch::Sender<SchedulerState>,
    conflict: watch::Sender<Option<ConflictInfo>>,
    timer: Option<Interval>,
    inflight: Option<BoxFuture<'static, Completion>>,
    /// Waiters of the single queued manual save
    queued_manual: Option<Vec<SaveReply>>,
    /// The current document was deleted and has not been edited since
    deleted: bool,
    deferred: VecDeque<Command>,
    closing: Vec<oneshot::Sender<()>>,
    closed: bool,
}

impl SaveScheduler {
    /// Start the scheduler task for `backend` and return its handle.
    pub fn spawn(
        backend: Arc<dyn StorageBackend>,
        document: SharedDocument,
        settings: SchedulerSettings,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> SchedulerHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let (token, token_rx) = watch::channel(settings.initial_token);
        let (state, state_rx) = watch::channel(SchedulerState::Idle);
        let (conflict, conflict_rx) = watch::channel(None);

        let scheduler = SaveScheduler {
            backend,
            document,
            session: settings.session,
            commands,
            events,
            token,
            state,
            conflict,
            timer: settings.interval.map(auto_save_timer),
            inflight: None,
            queued_manual: None,
            deleted: false,
            deferred: VecDeque::new(),
            closing: Vec::new(),
            closed: false,
        };
        tokio::spawn(scheduler.run());

        SchedulerHandle {
            tx,
            token: token_rx,
            state: state_rx,
            conflict: conflict_rx,
        }
    }

    #[instrument(skip(self), level = "debug", fields(session = self.session))]
    async fn run(mut self) {
        debug!("Save scheduler started");
        loop {
            tokio::select! {
                command = self.commands.recv(), if !self.closed => match command {
                    Some(command) => self.handle(command),
                    None => self.begin_shutdown(None),
                },
                _ = next_tick(&mut self.timer) => {
                    debug!("Auto-save timer fired");
                    self.request_auto_save();
                }
                completion = poll_inflight(&mut self.inflight) => {
                    self.inflight = None;
                    self.complete(completion);
                    if !self.closed {
                        self.drain();
                    }
                }
            }

            if self.closed && self.inflight.is_none() {
                break;
            }
        }
        self.finish();
        debug!("Save scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Save { intent, reply } => match intent {
                SaveIntent::Auto => self.request_auto_save(),
                SaveIntent::Manual => self.request_manual_save(reply),
            },
            Command::Reconfigure(interval) => {
                debug!(?interval, "Reconfiguring auto-save timer");
                self.timer = interval.map(auto_save_timer);
            }
            Command::Shutdown(reply) => self.begin_shutdown(Some(reply)),
            command if self.inflight.is_some() => self.deferred.push_back(command),
            Command::Load { path, reply } => self.start_load(path, reply),
            Command::Delete { path, reply } => self.start_delete(path, reply),
            Command::Resolve { resolution, reply } => self.resolve(resolution, reply),
        }
    }

    fn request_auto_save(&mut self) {
        if self.inflight.is_some() {
            debug!("Dropping auto-save, a call is in flight");
            return;
        }
        if self.conflict.borrow().is_some() {
            debug!("Skipping auto-save, conflict unresolved");
            return;
        }
        if !self.document.is_dirty() && (self.token.borrow().is_some() || self.deleted) {
            debug!("Skipping auto-save, document unchanged");
            return;
        }
        self.start_write(Vec::new(), None);
    }

    fn request_manual_save(&mut self, reply: Option<SaveReply>) {
        if let Some(conflict) = self.conflict.borrow().as_ref() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(StorageError::Conflict(format!(
                    "{} has an unresolved conflict",
                    conflict.path
                ))));
            }
            return;
        }

        if self.inflight.is_some() {
            // One queued request; later ones supersede it and share its outcome.
            let mut waiters = self.queued_manual.take().unwrap_or_default();
            waiters.extend(reply);
            self.queued_manual = Some(waiters);
            return;
        }

        self.run_manual(reply.into_iter().collect());
    }

    fn run_manual(&mut self, waiters: Vec<SaveReply>) {
        if !self.document.is_dirty() {
            let token = self.token.borrow().clone();
            if token.is_some() {
                debug!("Manual save of an unchanged document, nothing to write");
                for waiter in waiters {
                    let _ = waiter.send(Ok(token.clone()));
                }
                return;
            }
        }
        self.start_write(waiters, None);
    }

    /// Snapshot the document and start writing it. `expected` overrides the held token.
    fn start_write(&mut self, waiters: Vec<SaveReply>, expected: Option<Option<VersionToken>>) {
        let snapshot = self.document.snapshot();
        let expected = expected.unwrap_or_else(|| self.token.borrow().clone());
        let backend = Arc::clone(&self.backend);
        let message = update_message();

        debug!(
            path = %snapshot.path,
            generation = snapshot.generation,
            expected = ?expected,
            "Starting write"
        );
        self.state.send_replace(SchedulerState::Saving);
        self.inflight = Some(
            async move {
                let result = backend
                    .put(
                        &snapshot.path,
                        &snapshot.content,
                        &message,
                        expected.as_deref(),
                    )
                    .await;
                Completion::Write {
                    path: snapshot.path,
                    generation: snapshot.generation,
                    result,
                    waiters,
                }
            }
            .boxed(),
        );
    }

    fn start_load(&mut self, path: String, reply: oneshot::Sender<SyncResult<Document>>) {
        let backend = Arc::clone(&self.backend);
        self.state.send_replace(SchedulerState::Saving);
        self.inflight = Some(
            async move {
                let result = backend.get(&path).await;
                Completion::Load {
                    path,
                    result,
                    reply,
                }
            }
            .boxed(),
        );
    }

    fn start_delete(&mut self, path: String, reply: oneshot::Sender<SyncResult<()>>) {
        let backend = Arc::clone(&self.backend);
        let known = if path == self.document.snapshot().path {
            self.token.borrow().clone()
        } else {
            None
        };
        let message = format!("Delete mind map {}", path);

        self.state.send_replace(SchedulerState::Saving);
        self.inflight = Some(
            async move {
                let result = async {
                    let expected = match known {
                        Some(token) => token,
                        None => {
                            let current = backend.get(&path).await?;
                            current.version_token.ok_or_else(|| {
                                StorageError::Unsupported(format!(
                                    "{} has no version token to delete against",
                                    path
                                ))
                            })?
                        }
                    };
                    backend.delete(&path, &message, &expected).await
                }
                .await;
                Completion::Delete {
                    path,
                    result,
                    reply,
                }
            }
            .boxed(),
        );
    }

    fn start_refetch(&mut self, path: String, error: StorageError, waiters: Vec<SaveReply>) {
        let backend = Arc::clone(&self.backend);
        self.state.send_replace(SchedulerState::PendingRetry);
        self.inflight = Some(
            async move {
                let result = backend.get(&path).await;
                Completion::Refetch {
                    path,
                    error,
                    result,
                    waiters,
                }
            }
            .boxed(),
        );
    }

    fn resolve(&mut self, resolution: ConflictResolution, reply: SaveReply) {
        let Some(conflict) = self.conflict.borrow().clone() else {
            let _ = reply.send(Err(StorageError::Invalid(
                "no unresolved conflict".to_string(),
            )));
            return;
        };

        match resolution {
            ConflictResolution::Overwrite => {
                info!(path = %conflict.path, "Overwriting remote version");
                let expected = conflict.remote.and_then(|doc| doc.version_token);
                self.start_write(vec![reply], Some(expected));
            }
            ConflictResolution::DiscardLocal => {
                info!(path = %conflict.path, "Discarding local changes");
                self.conflict.send_replace(None);
                match conflict.remote {
                    Some(remote) => {
                        self.deleted = false;
                        self.document.load(&remote.path, remote.content.clone());
                        self.token.send_replace(remote.version_token.clone());
                        let token = remote.version_token.clone();
                        self.emit(SchedulerEvent::Adopted {
                            session: self.session,
                            document: remote,
                        });
                        let _ = reply.send(Ok(token));
                    }
                    None => {
                        // Nothing to adopt; the next save creates the document again.
                        self.token.send_replace(None);
                        let _ = reply.send(Ok(None));
                    }
                }
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Write {
                path,
                generation,
                result,
                waiters,
            } => match result {
                Ok(token) => {
                    info!(%path, generation, version_token = ?token, "Document saved");
                    self.token.send_replace(token.clone());
                    self.deleted = false;
                    self.document.mark_saved(generation);
                    self.conflict.send_replace(None);
                    self.state.send_replace(SchedulerState::Idle);
                    self.emit(SchedulerEvent::Saved {
                        session: self.session,
                        path,
                        generation,
                        version_token: token.clone(),
                    });
                    for waiter in waiters {
                        let _ = waiter.send(Ok(token.clone()));
                    }
                }
                Err(error) if error.is_conflict() => {
                    warn!(%path, "Write rejected as stale, re-fetching remote version");
                    self.start_refetch(path, error, waiters);
                }
                Err(error) => {
                    warn!(%path, "Write failed: {}", error);
                    self.state.send_replace(SchedulerState::Idle);
                    self.emit(SchedulerEvent::Failed {
                        session: self.session,
                        error: error.clone(),
                    });
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
            },
            Completion::Refetch {
                path,
                error,
                result,
                waiters,
            } => {
                let remote = match result {
                    Ok(document) => Some(document),
                    Err(e) => {
                        warn!(%path, "Re-fetch after conflict failed: {}", e);
                        if matches!(e, StorageError::AuthFailure(_)) {
                            self.emit(SchedulerEvent::Failed {
                                session: self.session,
                                error: e,
                            });
                        }
                        None
                    }
                };
                let conflict = ConflictInfo { path, remote };
                self.conflict.send_replace(Some(conflict.clone()));
                self.state.send_replace(SchedulerState::Idle);
                self.emit(SchedulerEvent::Conflict {
                    session: self.session,
                    conflict,
                });
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                // A queued manual save would hit the same conflict.
                for waiter in self.queued_manual.take().into_iter().flatten() {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
            Completion::Load {
                path,
                result,
                reply,
            } => {
                self.state.send_replace(SchedulerState::Idle);
                self.deleted = false;
                match &result {
                    Ok(document) => {
                        debug!(%path, version_token = ?document.version_token, "Document loaded");
                        self.document.load(&path, document.content.clone());
                        self.token.send_replace(document.version_token.clone());
                        self.conflict.send_replace(None);
                    }
                    Err(error) if error.is_not_found() => {
                        self.token.send_replace(None);
                    }
                    Err(_) => {}
                }
                let _ = reply.send(result);
            }
            Completion::Delete {
                path,
                result,
                reply,
            } => {
                self.state.send_replace(SchedulerState::Idle);
                if result.is_ok() && path == self.document.snapshot().path {
                    debug!(%path, "Current document deleted");
                    self.token.send_replace(None);
                    self.deleted = !self.document.is_dirty();
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Run queued work until a call is in flight again or nothing is left.
    fn drain(&mut self) {
        while self.inflight.is_none() {
            if let Some(waiters) = self.queued_manual.take() {
                self.run_manual(waiters);
            } else if let Some(command) = self.deferred.pop_front() {
                self.handle(command);
            } else {
                break;
            }
        }
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        if !self.closed {
            debug!("Save scheduler shutting down");
        }
        self.closed = true;
        self.timer = None;
        self.closing.extend(reply);
    }

    fn finish(&mut self) {
        let stopped = || StorageError::Invalid("save scheduler shut down".to_string());

        for waiter in self.queued_manual.take().into_iter().flatten() {
            let _ = waiter.send(Err(stopped()));
        }
        for command in self.deferred.drain(..) {
            command.reject(stopped());
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(stopped());
        }
        self.state.send_replace(SchedulerState::Idle);
        for reply in self.closing.drain(..) {
            let _ = reply.send(());
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }
}

fn auto_save_timer(period: Duration) -> Interval {
    let mut timer = time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn poll_inflight(inflight: &mut Option<BoxFuture<'static, Completion>>) -> Completion {
    match inflight.as_mut() {
        Some(future) => future.await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindmap_storage_core::MemoryBackend;

    const PATH: &str = "mindmap.smm";

    fn spawn(
        backend: &Arc<MemoryBackend>,
        document: &SharedDocument,
        interval: Option<Duration>,
    ) -> (SchedulerHandle, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SaveScheduler::spawn(
            backend.clone(),
            document.clone(),
            SchedulerSettings {
                session: 1,
                interval,
                initial_token: None,
            },
            tx,
        );
        (handle, rx)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_requests() {
        let backend = Arc::new(MemoryBackend::new());
        let document = SharedDocument::new(PATH, "{}");
        let (handle, _events) = spawn(&backend, &document, None);

        backend.hold_writes();
        document.edit("a".into());
        handle.request_save(SaveIntent::Manual);
        wait_for(|| backend.write_count() == 1).await;
        assert_eq!(handle.state(), SchedulerState::Saving);

        document.edit("b".into());
        let first = handle.save_now();
        document.edit("c".into());
        let second = handle.save_now();
        handle.request_save(SaveIntent::Auto);

        backend.release_writes();
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(first, Some("v2".to_string()));
        assert_eq!(first, second);
        assert_eq!(backend.write_count(), 2);
        assert_eq!(backend.max_concurrent_writes(), 1);

        let writes = backend.writes();
        assert_eq!(writes[0].expected, None);
        assert_eq!(writes[1].content, "c");
        assert_eq!(writes[1].expected.as_deref(), Some("v1"));
        assert!(writes[1].message.starts_with("Update mind map "));
        assert!(!document.is_dirty());
        assert_eq!(handle.version_token().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_manual_save_of_clean_document_skips_write() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(PATH, "{}");
        let document = SharedDocument::new(PATH, "");
        let (handle, _events) = spawn(&backend, &document, None);

        handle.load(PATH).await.unwrap();
        let token = handle.save_now().await.unwrap();

        assert_eq!(token.as_deref(), Some("v1"));
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_reconfigures() {
        let backend = Arc::new(MemoryBackend::new());
        let document = SharedDocument::new(PATH, "{}");
        let (handle, mut events) = spawn(&backend, &document, Some(Duration::from_secs(10)));

        document.edit("a".into());
        time::sleep(Duration::from_secs(9)).await;
        assert_eq!(backend.write_count(), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.write_count(), 1);
        assert!(matches!(
            events.recv().await,
            Some(SchedulerEvent::Saved { session: 1, .. })
        ));

        // Restarting at 30s must cancel the 10s timer.
        handle.reconfigure(Some(Duration::from_secs(30)));
        document.edit("b".into());
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(backend.write_count(), 1);

        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(backend.write_count(), 2);

        handle.reconfigure(None);
        document.edit("c".into());
        time::sleep(Duration::from_secs(300)).await;
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_ticks_do_not_write() {
        let backend = Arc::new(MemoryBackend::new());
        let document = SharedDocument::new(PATH, "{}");
        let (_handle, _events) = spawn(&backend, &document, Some(Duration::from_secs(5)));

        document.edit("a".into());
        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(backend.write_count(), 1);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_conflict_requires_decision() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(PATH, "base");
        let document = SharedDocument::new(PATH, "");
        let (handle, mut events) = spawn(&backend, &document, None);
        handle.load(PATH).await.unwrap();

        // Another writer moves the remote ahead.
        backend.put(PATH, "theirs", "m", Some("v1")).await.unwrap();

        document.edit("mine".into());
        let err = handle.save_now().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(handle.state(), SchedulerState::Idle);

        let conflict = handle.pending_conflict().unwrap();
        let remote = conflict.remote.unwrap();
        assert_eq!(remote.content, "theirs");
        assert_eq!(remote.version_token.as_deref(), Some("v2"));
        assert!(matches!(
            events.recv().await,
            Some(SchedulerEvent::Conflict { .. })
        ));

        // No silent retry: auto requests and manual saves are held back.
        handle.request_save(SaveIntent::Auto);
        assert!(handle.save_now().await.unwrap_err().is_conflict());
        assert_eq!(backend.write_count(), 2);
        assert_eq!(backend.stored(PATH).unwrap().content, "theirs");

        let token = handle
            .resolve_conflict(ConflictResolution::Overwrite)
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("v3"));
        assert_eq!(backend.stored(PATH).unwrap().content, "mine");
        assert!(handle.pending_conflict().is_none());
    }

    #[tokio::test]
    async fn test_discard_local_adopts_remote() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(PATH, "base");
        let document = SharedDocument::new(PATH, "");
        let (handle, _events) = spawn(&backend, &document, None);
        handle.load(PATH).await.unwrap();
        backend.put(PATH, "theirs", "m", Some("v1")).await.unwrap();

        document.edit("mine".into());
        assert!(handle.save_now().await.is_err());

        let token = handle
            .resolve_conflict(ConflictResolution::DiscardLocal)
            .await
            .unwrap();
        assert_eq!(token.as_deref(), Some("v2"));

        let snapshot = document.snapshot();
        assert_eq!(snapshot.content, "theirs");
        assert!(!snapshot.is_dirty());
        assert!(handle.pending_conflict().is_none());
    }

    #[tokio::test]
    async fn test_resolve_without_conflict_is_invalid() {
        let backend = Arc::new(MemoryBackend::new());
        let document = SharedDocument::new(PATH, "{}");
        let (handle, _events) = spawn(&backend, &document, None);

        let err = handle
            .resolve_conflict(ConflictResolution::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_network_failure_is_not_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let document = SharedDocument::new(PATH, "{}");
        let (handle, mut events) = spawn(&backend, &document, None);

        backend.fail_next_write(StorageError::Network("connection reset".into()));
        document.edit("a".into());
        let err = handle.save_now().await.unwrap_err();
        assert_eq!(err, StorageError::Network("connection reset".into()));
        assert!(matches!(
            events.recv().await,
            Some(SchedulerEvent::Failed { .. })
        ));
        assert_eq!(backend.write_count(), 1);
        assert!(document.is_dirty());

        assert_eq!(
            handle.save_now().await.unwrap().as_deref(),
            Some("v1")
        );
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_fetches_unknown_token() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("other.smm", "x");
        let document = SharedDocument::new(PATH, "{}");
        let (handle, _events) = spawn(&backend, &document, None);

        handle.delete("other.smm").await.unwrap();
        assert!(backend.stored("other.smm").is_none());
    }

    #[tokio::test]
    async fn test_load_missing_document_is_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let document = SharedDocument::new(PATH, "{}");
        let (handle, _events) = spawn(&backend, &document, None);

        let err = handle.load(PATH).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(handle.version_token().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_document_is_not_recreated_by_timer() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(PATH, "{}");
        let document = SharedDocument::new(PATH, "");
        let (handle, _events) = spawn(&backend, &document, Some(Duration::from_secs(5)));

        handle.load(PATH).await.unwrap();
        handle.delete(PATH).await.unwrap();
        assert!(handle.version_token().is_none());

        time::sleep(Duration::from_secs(6)).await;
        assert!(backend.stored(PATH).is_none());
        assert_eq!(backend.write_count(), 0);

        // An edit after the delete creates the document again.
        document.edit("new".into());
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.writes()[0].expected, None);
        assert_eq!(backend.stored(PATH).unwrap().content, "new");
    }

    #[tokio::test]
    async fn test_initial_token_is_used_for_first_write() {
        let backend = Arc::new(MemoryBackend::new());
        let v1 = backend.insert(PATH, "{}");
        let document = SharedDocument::new(PATH, "{}");
        let (tx, _events) = mpsc::unbounded_channel();
        let handle = SaveScheduler::spawn(
            backend.clone(),
            document.clone(),
            SchedulerSettings {
                session: 2,
                interval: None,
                initial_token: Some(v1.clone()),
            },
            tx,
        );
        assert_eq!(handle.version_token(), Some(v1));

        document.edit("a".into());
        assert_eq!(handle.save_now().await.unwrap().as_deref(), Some("v2"));
        assert_eq!(backend.writes()[0].expected.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_auth_failure_during_refetch_is_reported() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(PATH, "base");
        let document = SharedDocument::new(PATH, "");
        let (handle, mut events) = spawn(&backend, &document, None);
        handle.load(PATH).await.unwrap();
        backend.put(PATH, "theirs", "m", Some("v1")).await.unwrap();

        backend.fail_next_read(StorageError::AuthFailure("token revoked".into()));
        document.edit("mine".into());
        assert!(handle.save_now().await.unwrap_err().is_conflict());

        assert!(matches!(
            events.recv().await,
            Some(SchedulerEvent::Failed {
                error: StorageError::AuthFailure(_),
                ..
            })
        ));
        assert!(handle.pending_conflict().unwrap().remote.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_inflight_write() {
        let backend = Arc::new(MemoryBackend::new());
        let document = SharedDocument::new(PATH, "{}");
        let (handle, _events) = spawn(&backend, &document, Some(Duration::from_secs(1)));

        backend.hold_writes();
        document.edit("a".into());
        let save = handle.save_now();
        wait_for(|| backend.write_count() == 1).await;
        let queued = handle.load(PATH);

        let stopper = handle.clone();
        let shutdown = tokio::spawn(async move { stopper.shutdown().await });
        time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());

        backend.release_writes();
        shutdown.await.unwrap();

        assert_eq!(save.await.unwrap().as_deref(), Some("v1"));
        assert!(matches!(queued.await, Err(StorageError::Invalid(_))));
        assert_eq!(backend.stored(PATH).unwrap().content, "a");
        assert!(matches!(
            handle.save_now().await,
            Err(StorageError::Invalid(_))
        ));
    }
}
