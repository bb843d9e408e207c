//! In-memory versioned backend.
//!
//! Implements the same optimistic-concurrency contract as the remote host, records every
//! write, and (with the `test-util` feature) can hold writes open or inject failures so
//! callers can be tested against slow or failing storage.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::backend::{DocumentEntry, StorageBackend};
use crate::document::{Document, StorageMode, VersionToken, DOCUMENT_EXTENSION};
use crate::error::{StorageError, SyncResult};

/// A write observed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub path: String,
    pub content: String,
    pub message: String,
    pub expected: Option<VersionToken>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    content: String,
    version: VersionToken,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    next_version: u64,
    writes: Vec<WriteCall>,
    failures: VecDeque<StorageError>,
    read_failures: VecDeque<StorageError>,
}

/// Versioned in-memory backend; tokens are `v1`, `v2`, ... in write order.
pub struct MemoryBackend {
    state: Mutex<State>,
    gate: watch::Sender<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    access_error: Mutex<Option<StorageError>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::default()),
            gate,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            access_error: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block subsequent writes until `release_writes` is called.
    #[cfg(any(test, feature = "test-util"))]
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Fail the next write (or delete) with `error` instead of applying it.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next_write(&self, error: StorageError) {
        self.lock().failures.push_back(error);
    }

    /// Fail the next `get` (or `list`) with `error`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next_read(&self, error: StorageError) {
        self.lock().read_failures.push_back(error);
    }

    /// Make `check_access` fail with `error`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn deny_access(&self, error: StorageError) {
        *self
            .access_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
    }

    /// All writes received so far, in arrival order.
    pub fn writes(&self) -> Vec<WriteCall> {
        self.lock().writes.clone()
    }

    /// Writes that reached the backend, including rejected ones.
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// Highest number of writes that were in progress at the same time.
    #[cfg(any(test, feature = "test-util"))]
    pub fn max_concurrent_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Current stored object, bypassing the async interface.
    pub fn stored(&self, path: &str) -> Option<Document> {
        self.lock()
            .objects
            .get(path)
            .map(|o| Document::new(path, o.content.clone()).with_version(o.version.clone()))
    }

    /// Seed an object as if a previous writer had created it.
    pub fn insert(&self, path: &str, content: &str) -> VersionToken {
        let mut state = self.lock();
        Self::store(&mut state, path, content)
    }

    fn store(state: &mut State, path: &str, content: &str) -> VersionToken {
        state.next_version += 1;
        let version = format!("v{}", state.next_version);
        state.objects.insert(
            path.to_string(),
            StoredObject {
                content: content.to_string(),
                version: version.clone(),
            },
        );
        version
    }

    async fn enter_write(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = gate.wait_for(|open| *open).await;
    }

    fn leave_write(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn take_read_failure(&self) -> SyncResult<()> {
        match self.lock().read_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn apply_put(
        &self,
        path: &str,
        content: &str,
        expected: Option<&str>,
    ) -> SyncResult<Option<VersionToken>> {
        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let current = state.objects.get(path).map(|o| o.version.clone());
        match (current.as_deref(), expected) {
            (None, None) => {}
            (Some(current), Some(expected)) if current == expected => {}
            (None, Some(_)) => return Err(StorageError::NotFound(path.to_string())),
            _ => return Err(StorageError::Conflict(path.to_string())),
        }

        let version = Self::store(&mut state, path, content);
        debug!("Stored {} at {}", path, version);
        Ok(Some(version))
    }

    fn apply_delete(&self, path: &str, expected: &str) -> SyncResult<()> {
        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        match state.objects.get(path) {
            None => Err(StorageError::NotFound(path.to_string())),
            Some(object) if object.version != expected => {
                Err(StorageError::Conflict(path.to_string()))
            }
            Some(_) => {
                state.objects.remove(path);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::RemoteVersioned
    }

    async fn get(&self, path: &str) -> SyncResult<Document> {
        self.take_read_failure()?;
        self.stored(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: Option<&str>,
    ) -> SyncResult<Option<VersionToken>> {
        self.lock().writes.push(WriteCall {
            path: path.to_string(),
            content: content.to_string(),
            message: message.to_string(),
            expected: expected.map(str::to_string),
        });

        self.enter_write().await;
        let result = self.apply_put(path, content, expected);
        self.leave_write();
        result
    }

    async fn delete(&self, path: &str, _message: &str, expected: &str) -> SyncResult<()> {
        self.enter_write().await;
        let result = self.apply_delete(path, expected);
        self.leave_write();
        result
    }

    async fn list(&self, directory: &str) -> SyncResult<Vec<DocumentEntry>> {
        self.take_read_failure()?;
        let prefix = if directory.is_empty() {
            String::new()
        } else {
            format!("{}/", directory.trim_end_matches('/'))
        };

        Ok(self
            .lock()
            .objects
            .iter()
            .filter_map(|(path, object)| {
                let name = path.strip_prefix(&prefix)?;
                if name.contains('/') || !name.ends_with(DOCUMENT_EXTENSION) {
                    return None;
                }
                Some(DocumentEntry {
                    name: name.to_string(),
                    path: path.clone(),
                    version_token: object.version.clone(),
                    size: object.content.len() as u64,
                })
            })
            .collect())
    }

    async fn check_access(&self) -> SyncResult<()> {
        match self
            .access_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_then_update() {
        let backend = MemoryBackend::new();
        let v1 = backend.put("a.smm", "one", "create", None).await.unwrap();
        assert_eq!(v1.as_deref(), Some("v1"));

        let v2 = backend
            .put("a.smm", "two", "update", v1.as_deref())
            .await
            .unwrap();
        assert_eq!(v2.as_deref(), Some("v2"));

        let doc = backend.get("a.smm").await.unwrap();
        assert_eq!(doc.content, "two");
        assert_eq!(doc.version_token.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_stale_token_is_rejected_without_lost_update() {
        let backend = MemoryBackend::new();
        let t1 = backend
            .put("a.smm", "base", "create", None)
            .await
            .unwrap()
            .unwrap();

        // A third party updates from T1 to T2.
        backend
            .put("a.smm", "third party", "update", Some(&t1))
            .await
            .unwrap();

        // The second writer still believes T1 is current.
        let err = backend
            .put("a.smm", "second writer", "update", Some(&t1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(backend.stored("a.smm").unwrap().content, "third party");
    }

    #[tokio::test]
    async fn test_create_over_existing_conflicts() {
        let backend = MemoryBackend::new();
        backend.insert("a.smm", "existing");
        let err = backend.put("a.smm", "new", "create", None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_requires_current_token() {
        let backend = MemoryBackend::new();
        let v1 = backend.insert("a.smm", "x");
        assert!(backend.delete("a.smm", "rm", "v9").await.unwrap_err().is_conflict());
        backend.delete("a.smm", "rm", &v1).await.unwrap();
        assert!(backend.get("a.smm").await.unwrap_err().is_not_found());
        assert!(backend.delete("a.smm", "rm", &v1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_extension_and_directory() {
        let backend = MemoryBackend::new();
        backend.insert("maps/a.smm", "a");
        backend.insert("maps/notes.txt", "n");
        backend.insert("maps/deep/b.smm", "b");
        backend.insert("root.smm", "r");

        let entries = backend.list("maps").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.smm");
        assert_eq!(entries[0].path, "maps/a.smm");
        assert_eq!(entries[0].size, 1);

        let root = backend.list("").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "root.smm");
    }

    #[tokio::test]
    async fn test_injected_failure_consumed_once() {
        let backend = MemoryBackend::new();
        backend.fail_next_write(StorageError::Network("reset".into()));
        assert!(matches!(
            backend.put("a.smm", "x", "m", None).await,
            Err(StorageError::Network(_))
        ));
        assert!(backend.put("a.smm", "x", "m", None).await.is_ok());
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let backend = MemoryBackend::new();
        backend.insert("a.smm", "x");
        backend.fail_next_read(StorageError::AuthFailure("revoked".into()));
        assert!(matches!(
            backend.get("a.smm").await,
            Err(StorageError::AuthFailure(_))
        ));
        assert_eq!(backend.get("a.smm").await.unwrap().content, "x");
    }

    #[tokio::test]
    async fn test_hold_writes() {
        let backend = Arc::new(MemoryBackend::new());
        backend.hold_writes();

        let writer = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.put("a.smm", "x", "m", None).await })
        };
        tokio::task::yield_now().await;
        assert!(backend.stored("a.smm").is_none());
        assert_eq!(backend.write_count(), 1);

        backend.release_writes();
        let token = writer.await.unwrap().unwrap();
        assert_eq!(token.as_deref(), Some("v1"));
        assert_eq!(backend.max_concurrent_writes(), 1);
    }
}
