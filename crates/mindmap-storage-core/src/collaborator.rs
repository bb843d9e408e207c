//! Backends that delegate persistence to the embedding environment.
//!
//! Neither variant versions documents: reads return `version_token: None` and writes
//! ignore the expected token.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::backend::{DocumentEntry, StorageBackend};
use crate::document::{Document, StorageMode, VersionToken};
use crate::error::{StorageError, SyncResult};

/// Local-file access owned by the embedding environment.
pub trait LocalCollaborator: Send + Sync {
    /// Read the document currently open in the editor.
    fn read_current_document(&self) -> SyncResult<Document>;

    /// Write the document back to its file.
    fn write_document(&self, document: &Document) -> SyncResult<()>;
}

/// Document persistence owned by a host application that embeds the editor.
pub trait HostCollaborator: Send + Sync {
    fn get_mind_map_data(&self) -> SyncResult<Document>;

    fn save_mind_map_data(&self, document: &Document) -> SyncResult<()>;
}

/// `StorageMode::Local` backend.
#[derive(Clone)]
pub struct LocalBackend {
    collaborator: Arc<dyn LocalCollaborator>,
}

impl LocalBackend {
    pub fn new(collaborator: Arc<dyn LocalCollaborator>) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::Local
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, _path: &str) -> SyncResult<Document> {
        let mut document = self.collaborator.read_current_document()?;
        document.version_token = None;
        Ok(document)
    }

    #[instrument(skip(self, content, _message, _expected), level = "debug", fields(content_len = content.len()))]
    async fn put(
        &self,
        path: &str,
        content: &str,
        _message: &str,
        _expected: Option<&str>,
    ) -> SyncResult<Option<VersionToken>> {
        self.collaborator
            .write_document(&Document::new(path, content))?;
        debug!("Wrote {} bytes to local file {}", content.len(), path);
        Ok(None)
    }

    async fn delete(&self, _path: &str, _message: &str, _expected: &str) -> SyncResult<()> {
        Err(StorageError::Unsupported(
            "local file mode cannot delete documents".to_string(),
        ))
    }

    async fn list(&self, _directory: &str) -> SyncResult<Vec<DocumentEntry>> {
        Err(StorageError::Unsupported(
            "local file mode cannot list documents".to_string(),
        ))
    }
}

/// `StorageMode::HostManaged` backend.
#[derive(Clone)]
pub struct HostManagedBackend {
    host: Arc<dyn HostCollaborator>,
}

impl HostManagedBackend {
    pub fn new(host: Arc<dyn HostCollaborator>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl StorageBackend for HostManagedBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::HostManaged
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, _path: &str) -> SyncResult<Document> {
        let mut document = self.host.get_mind_map_data()?;
        document.version_token = None;
        Ok(document)
    }

    #[instrument(skip(self, content, _message, _expected), level = "debug", fields(content_len = content.len()))]
    async fn put(
        &self,
        path: &str,
        content: &str,
        _message: &str,
        _expected: Option<&str>,
    ) -> SyncResult<Option<VersionToken>> {
        self.host.save_mind_map_data(&Document::new(path, content))?;
        Ok(None)
    }

    async fn delete(&self, _path: &str, _message: &str, _expected: &str) -> SyncResult<()> {
        Err(StorageError::Unsupported(
            "the host application owns document deletion".to_string(),
        ))
    }

    async fn list(&self, _directory: &str) -> SyncResult<Vec<DocumentEntry>> {
        Err(StorageError::Unsupported(
            "the host application owns document listing".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        stored: Mutex<Option<Document>>,
    }

    impl HostCollaborator for RecordingHost {
        fn get_mind_map_data(&self) -> SyncResult<Document> {
            self.stored
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| StorageError::NotFound("host".into()))
        }

        fn save_mind_map_data(&self, document: &Document) -> SyncResult<()> {
            *self.stored.lock().unwrap() = Some(document.clone());
            Ok(())
        }
    }

    impl LocalCollaborator for RecordingHost {
        fn read_current_document(&self) -> SyncResult<Document> {
            self.get_mind_map_data()
        }

        fn write_document(&self, document: &Document) -> SyncResult<()> {
            self.save_mind_map_data(document)
        }
    }

    #[tokio::test]
    async fn test_host_round_trip_never_versions() {
        let host = Arc::new(RecordingHost::default());
        let backend = HostManagedBackend::new(host.clone());

        assert!(backend.get("x.smm").await.unwrap_err().is_not_found());

        let token = backend
            .put("x.smm", "{\"root\":{}}", "msg", Some("ignored"))
            .await
            .unwrap();
        assert_eq!(token, None);

        let doc = backend.get("x.smm").await.unwrap();
        assert_eq!(doc.content, "{\"root\":{}}");
        assert_eq!(doc.version_token, None);
        assert_eq!(backend.mode(), StorageMode::HostManaged);
    }

    #[tokio::test]
    async fn test_local_delete_and_list_unsupported() {
        let backend = LocalBackend::new(Arc::new(RecordingHost::default()));
        assert!(matches!(
            backend.delete("a.smm", "msg", "v1").await,
            Err(StorageError::Unsupported(_))
        ));
        assert!(matches!(
            backend.list("").await,
            Err(StorageError::Unsupported(_))
        ));
        assert!(backend.check_access().await.is_ok());
    }
}
