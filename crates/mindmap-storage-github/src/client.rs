//! GitHub contents API client.
//!
//! Every call carries the bearer token and the configured timeout. Payloads are run
//! through the transport codec here and nowhere else.

use std::time::Duration;

use mindmap_storage_core::{
    codec, BackendConfig, Document, DocumentEntry, StorageError, SyncResult, VersionToken,
    DOCUMENT_EXTENSION,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

const USER_AGENT: &str = concat!("mindmap-sync/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/vnd.github.v3+json";

/// Connection settings for one repository branch.
#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token: String,
    pub timeout: Duration,
}

impl From<&BackendConfig> for GitHubSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            branch: config.branch.clone(),
            token: config.token.clone(),
            timeout: config.request_timeout(),
        }
    }
}

/// File object returned by `GET /contents/{path}`.
#[derive(Debug, Deserialize)]
struct ContentsFile {
    path: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

/// Directory item returned by `GET /contents/{dir}`.
#[derive(Debug, Deserialize)]
struct ContentsItem {
    name: String,
    path: String,
    sha: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    message: &'a str,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutContent,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: String,
}

/// Client for the repository contents API.
pub struct GitHubClient {
    http: Client,
    settings: GitHubSettings,
}

impl GitHubClient {
    pub fn new(settings: GitHubSettings) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StorageError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &GitHubSettings {
        &self.settings
    }

    fn repo_url(&self) -> String {
        format!(
            "{}/repos/{}/{}",
            self.settings.api_base,
            urlencoding::encode(&self.settings.owner),
            urlencoding::encode(&self.settings.repo)
        )
    }

    fn contents_url(&self, path: &str) -> String {
        let encoded = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        if encoded.is_empty() {
            format!("{}/contents", self.repo_url())
        } else {
            format!("{}/contents/{}", self.repo_url(), encoded)
        }
    }

    fn request(&self, method: Method, url: &str) -> SyncResult<RequestBuilder> {
        if self.settings.token.is_empty() {
            return Err(StorageError::AuthFailure(
                "no access token configured".to_string(),
            ));
        }
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(&self.settings.token)
            .header("Accept", ACCEPT))
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> SyncResult<Response> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                StorageError::Network(format!(
                    "{} timed out after {:?}",
                    operation, self.settings.timeout
                ))
            } else {
                StorageError::Network(format!("{} failed: {}", operation, e))
            }
        })
    }

    async fn read_body(response: Response, operation: &str) -> SyncResult<String> {
        response
            .text()
            .await
            .map_err(|e| StorageError::Network(format!("{} body read failed: {}", operation, e)))
    }

    /// Map a non-success status onto the error taxonomy.
    async fn status_error(response: Response, path: &str, operation: &str) -> StorageError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::AuthFailure(format!(
                "{} rejected with {}: {}",
                operation, status, body
            )),
            StatusCode::NOT_FOUND => StorageError::NotFound(path.to_string()),
            // 422 is what the host answers for a missing or stale sha.
            StatusCode::CONFLICT
            | StatusCode::PRECONDITION_FAILED
            | StatusCode::UNPROCESSABLE_ENTITY => StorageError::Conflict(path.to_string()),
            _ => StorageError::Network(format!(
                "{} returned {}: {}",
                operation, status, body
            )),
        }
    }

    /// Fetch a file and its version token.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_file(&self, path: &str) -> SyncResult<Document> {
        let url = self.contents_url(path);
        let request = self
            .request(Method::GET, &url)?
            .query(&[("ref", self.settings.branch.as_str())]);
        let response = self.send(request, "GET contents").await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response, path, "GET contents").await);
        }

        let body = Self::read_body(response, "GET contents").await?;
        let value: serde_json::Value = serde_json::from_str(&body)?;
        if value.is_array() {
            return Err(StorageError::Invalid(format!("{} is a directory", path)));
        }
        let file: ContentsFile = serde_json::from_value(value)?;

        if let Some(encoding) = file.encoding.as_deref() {
            if encoding != "base64" {
                return Err(StorageError::Encoding(format!(
                    "unsupported content encoding '{}' for {}",
                    encoding, path
                )));
            }
        }

        let wire = file.content.ok_or_else(|| {
            StorageError::Encoding(format!("no content returned for {}", path))
        })?;
        let content = codec::decode(&wire)?;

        debug!("Fetched {} ({} bytes, sha {})", file.path, content.len(), file.sha);
        Ok(Document::new(file.path, content).with_version(file.sha))
    }

    /// Create or update a file. `sha` must be the current token when updating.
    #[instrument(skip(self, content, message), level = "debug", fields(content_len = content.len()))]
    pub async fn put_file(
        &self,
        path: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> SyncResult<VersionToken> {
        let url = self.contents_url(path);
        let body = PutRequest {
            message,
            content: codec::encode(content),
            branch: &self.settings.branch,
            sha,
        };
        let request = self.request(Method::PUT, &url)?.json(&body);
        let response = self.send(request, "PUT contents").await?;

        if !response.status().is_success() {
            let error = Self::status_error(response, path, "PUT contents").await;
            if error.is_conflict() {
                warn!("Rejected write to {} with stale sha {:?}", path, sha);
            }
            return Err(error);
        }

        let body = Self::read_body(response, "PUT contents").await?;
        let parsed: PutResponse = serde_json::from_str(&body)?;
        debug!("Stored {} at sha {}", path, parsed.content.sha);
        Ok(parsed.content.sha)
    }

    /// Delete a file that is still at version `sha`.
    #[instrument(skip(self, message), level = "debug")]
    pub async fn delete_file(&self, path: &str, message: &str, sha: &str) -> SyncResult<()> {
        let url = self.contents_url(path);
        let body = DeleteRequest {
            message,
            sha,
            branch: &self.settings.branch,
        };
        let request = self.request(Method::DELETE, &url)?.json(&body);
        let response = self.send(request, "DELETE contents").await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response, path, "DELETE contents").await);
        }

        debug!("Deleted {} (was sha {})", path, sha);
        Ok(())
    }

    /// List document files in a directory. A missing directory lists as empty.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_files(&self, directory: &str) -> SyncResult<Vec<DocumentEntry>> {
        let url = self.contents_url(directory);
        let request = self
            .request(Method::GET, &url)?
            .query(&[("ref", self.settings.branch.as_str())]);
        let response = self.send(request, "GET directory").await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response, directory, "GET directory").await);
        }

        let body = Self::read_body(response, "GET directory").await?;
        let value: serde_json::Value = serde_json::from_str(&body)?;
        if !value.is_array() {
            return Err(StorageError::Invalid(format!(
                "{} is a file, not a directory",
                directory
            )));
        }
        let items: Vec<ContentsItem> = serde_json::from_value(value)?;

        let entries: Vec<DocumentEntry> = items
            .into_iter()
            .filter(|item| item.kind == "file" && item.name.ends_with(DOCUMENT_EXTENSION))
            .map(|item| DocumentEntry {
                name: item.name,
                path: item.path,
                version_token: item.sha,
                size: item.size,
            })
            .collect();

        debug!("Listed {} documents in '{}'", entries.len(), directory);
        Ok(entries)
    }

    /// Whether the token is accepted by the host.
    pub async fn validate_credentials(&self) -> bool {
        self.credentials_accepted().await.unwrap_or(false)
    }

    /// Whether the configured repository is reachable with the token.
    pub async fn validate_repository_access(&self) -> bool {
        self.repository_accessible().await.unwrap_or(false)
    }

    /// `Ok(false)` when the host rejects the token; transport failures are errors.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn credentials_accepted(&self) -> SyncResult<bool> {
        let url = format!("{}/user", self.settings.api_base);
        self.reachable(&url, "GET user").await
    }

    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn repository_accessible(&self) -> SyncResult<bool> {
        let url = self.repo_url();
        self.reachable(&url, "GET repository").await
    }

    async fn reachable(&self, url: &str, operation: &str) -> SyncResult<bool> {
        let request = self.request(Method::GET, url)?;
        let response = self.send(request, operation).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                debug!("{} rejected with {}", operation, response.status());
                Ok(false)
            }
            _ => Err(Self::status_error(response, url, operation).await),
        }
    }
}
