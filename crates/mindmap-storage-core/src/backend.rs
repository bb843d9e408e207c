use async_trait::async_trait;

use crate::document::{Document, StorageMode, VersionToken};
use crate::error::SyncResult;

/// A document file listed from a backend directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    /// File name
    pub name: String,
    /// Path relative to the backend root
    pub path: String,
    pub version_token: VersionToken,
    /// Size in bytes
    pub size: u64,
}

/// Storage abstraction implemented by every backend variant.
///
/// Content crossing this boundary is plain Unicode text. Versioned backends enforce
/// optimistic concurrency: a write carrying a stale `expected` token must fail with
/// `StorageError::Conflict` and leave the stored object untouched.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which storage variant this backend implements.
    fn mode(&self) -> StorageMode;

    /// Fetch the document at `path`.
    ///
    /// A missing document is reported as `StorageError::NotFound`, which callers treat
    /// as "not created yet" rather than as a failure.
    async fn get(&self, path: &str) -> SyncResult<Document>;

    /// Create (`expected` is `None`) or update (`expected` is the current token) a document.
    ///
    /// # Returns
    /// The new version token, or `None` for backends that do not version documents.
    async fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: Option<&str>,
    ) -> SyncResult<Option<VersionToken>>;

    /// Delete the document at `path` if it is still at version `expected`.
    async fn delete(&self, path: &str, message: &str, expected: &str) -> SyncResult<()>;

    /// List document files in `directory` (empty string for the root).
    async fn list(&self, directory: &str) -> SyncResult<Vec<DocumentEntry>>;

    /// Side-effect-free reachability check run before the backend is activated.
    async fn check_access(&self) -> SyncResult<()> {
        Ok(())
    }
}
