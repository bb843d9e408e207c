//! `StorageMode::RemoteVersioned` backend over the contents API.

use std::sync::Arc;

use async_trait::async_trait;
use mindmap_storage_core::{
    BackendConfig, Document, DocumentEntry, StorageBackend, StorageError, StorageMode,
    SyncResult, VersionToken,
};
use tracing::{debug, instrument};

use crate::client::{GitHubClient, GitHubSettings};

/// Remote backend; every document is a file in one repository branch.
pub struct GitHubBackend {
    client: Arc<GitHubClient>,
}

impl GitHubBackend {
    pub fn new(client: Arc<GitHubClient>) -> Self {
        Self { client }
    }

    /// Build a backend from the persisted remote configuration.
    pub fn from_config(config: &BackendConfig) -> SyncResult<Self> {
        config.require_remote()?;
        let client = GitHubClient::new(GitHubSettings::from(config))?;
        Ok(Self::new(Arc::new(client)))
    }

    pub fn client(&self) -> &GitHubClient {
        &self.client
    }
}

#[async_trait]
impl StorageBackend for GitHubBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::RemoteVersioned
    }

    async fn get(&self, path: &str) -> SyncResult<Document> {
        self.client.get_file(path).await
    }

    async fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: Option<&str>,
    ) -> SyncResult<Option<VersionToken>> {
        self.client
            .put_file(path, content, message, expected)
            .await
            .map(Some)
    }

    async fn delete(&self, path: &str, message: &str, expected: &str) -> SyncResult<()> {
        self.client.delete_file(path, message, expected).await
    }

    async fn list(&self, directory: &str) -> SyncResult<Vec<DocumentEntry>> {
        self.client.list_files(directory).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn check_access(&self) -> SyncResult<()> {
        let settings = self.client.settings();
        if !self.client.credentials_accepted().await? {
            return Err(StorageError::AuthFailure(
                "the access token was rejected".to_string(),
            ));
        }
        if !self.client.repository_accessible().await? {
            return Err(StorageError::AuthFailure(format!(
                "repository {}/{} is not accessible with this token",
                settings.owner, settings.repo
            )));
        }
        debug!(
            "Access to {}/{}@{} confirmed",
            settings.owner, settings.repo, settings.branch
        );
        Ok(())
    }
}
