//! Local filesystem collaborator.
//!
//! Documents are plain files under a root directory. Writes go through a temp file
//! followed by a rename so a crash never leaves a half-written document behind.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use mindmap_storage_core::{
    Document, LocalCollaborator, StorageError, SyncResult, DEFAULT_DOCUMENT_PATH,
};
use tracing::{debug, instrument};

/// Local file store rooted at a directory.
#[derive(Debug)]
pub struct LocalFileStore {
    root: PathBuf,
    /// Relative path of the document currently open in the editor
    current: RwLock<String>,
}

impl LocalFileStore {
    /// Create a store rooted at `root` with the default document open.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: RwLock::new(DEFAULT_DOCUMENT_PATH.to_string()),
        }
    }

    /// Default root: `<data dir>/mindmap-sync/documents`.
    pub fn default_root() -> SyncResult<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("mindmap-sync").join("documents"))
            .ok_or_else(|| StorageError::Io("no data directory for this platform".to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Switch the document that subsequent reads and writes address.
    pub fn open(&self, path: &str) -> SyncResult<()> {
        Self::check_relative(path)?;
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = path.to_string();
        Ok(())
    }

    pub fn current_path(&self) -> String {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reject absolute paths and `..` so documents stay under the root.
    fn check_relative(path: &str) -> SyncResult<()> {
        let candidate = Path::new(path);
        let escapes = candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(StorageError::Invalid(format!(
                "document path must be relative to the store root: {}",
                path
            )));
        }
        Ok(())
    }

    fn file_path(&self, path: &str) -> SyncResult<PathBuf> {
        Self::check_relative(path)?;
        Ok(self.root.join(path))
    }
}

impl LocalCollaborator for LocalFileStore {
    #[instrument(skip(self), level = "debug")]
    fn read_current_document(&self) -> SyncResult<Document> {
        let path = self.current_path();
        let file_path = self.file_path(&path)?;

        match fs::read_to_string(&file_path) {
            Ok(content) => {
                debug!("Read {} bytes from {}", content.len(), file_path.display());
                Ok(Document::new(path, content))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(path)),
            Err(e) if e.kind() == ErrorKind::InvalidData => Err(StorageError::Encoding(format!(
                "{} is not valid UTF-8: {}",
                file_path.display(),
                e
            ))),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                file_path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, document), level = "debug", fields(path = %document.path, content_len = document.content.len()))]
    fn write_document(&self, document: &Document) -> SyncResult<()> {
        let file_path = self.file_path(&document.path)?;

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::Io(format!(
                    "Failed to create parent directory for {}: {}",
                    file_path.display(),
                    e
                ))
            })?;
        }

        let temp_path = file_path.with_extension("smm.tmp");
        fs::write(&temp_path, document.content.as_bytes()).map_err(|e| {
            StorageError::Io(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        fs::rename(&temp_path, &file_path).map_err(|e| {
            StorageError::Io(format!(
                "Failed to rename temp file to {}: {}",
                file_path.display(),
                e
            ))
        })?;

        debug!(
            "Wrote {} bytes to {}",
            document.content.len(),
            file_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindmap_storage_core::{LocalBackend, StorageBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (LocalFileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path());
        (store, temp_dir)
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (store, _temp_dir) = setup();
        let err = store.read_current_document().unwrap_err();
        assert_eq!(err, StorageError::NotFound("mindmap.smm".to_string()));
    }

    #[test]
    fn test_write_then_read() {
        let (store, temp_dir) = setup();
        let doc = Document::new("mindmap.smm", "{\"root\":{\"data\":{\"text\":\"中心主题\"}}}");
        store.write_document(&doc).unwrap();

        let read = store.read_current_document().unwrap();
        assert_eq!(read.content, doc.content);
        assert_eq!(read.version_token, None);

        // No temp file left behind
        assert!(!temp_dir.path().join("mindmap.smm.tmp").exists());
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let (store, temp_dir) = setup();
        store.open("nested/dir/plan.smm").unwrap();
        store
            .write_document(&Document::new("nested/dir/plan.smm", "{}"))
            .unwrap();
        assert!(temp_dir.path().join("nested/dir/plan.smm").exists());
        assert_eq!(store.read_current_document().unwrap().path, "nested/dir/plan.smm");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (store, _temp_dir) = setup();
        assert!(matches!(store.open("../outside.smm"), Err(StorageError::Invalid(_))));
        assert!(matches!(store.open("/etc/passwd"), Err(StorageError::Invalid(_))));
        assert!(store
            .write_document(&Document::new("../x.smm", "{}"))
            .is_err());
    }

    #[test]
    fn test_invalid_utf8_is_encoding_error() {
        let (store, temp_dir) = setup();
        fs::write(temp_dir.path().join("mindmap.smm"), [0xFFu8, 0xFE, 0x00]).unwrap();
        assert!(matches!(
            store.read_current_document(),
            Err(StorageError::Encoding(_))
        ));
    }

    #[tokio::test]
    async fn test_through_local_backend() {
        let (store, _temp_dir) = setup();
        let backend = LocalBackend::new(Arc::new(store));

        assert!(backend.get("mindmap.smm").await.unwrap_err().is_not_found());
        let token = backend
            .put("mindmap.smm", "{\"layout\":\"mindMap\"}", "save", None)
            .await
            .unwrap();
        assert_eq!(token, None);
        assert_eq!(
            backend.get("mindmap.smm").await.unwrap().content,
            "{\"layout\":\"mindMap\"}"
        );
    }
}
