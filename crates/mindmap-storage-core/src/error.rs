use serde::Serialize;

/// Result type for storage operations.
pub type SyncResult<T> = Result<T, StorageError>;

/// Errors surfaced by every storage backend variant.
///
/// `NotFound` and `Conflict` are modeled outcomes the caller is expected to handle;
/// the rest are failures that propagate to the user-facing notification channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {0}: the stored document changed since it was read")]
    Conflict(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Flat error category used by notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AuthFailure,
    Network,
    Encoding,
    Unsupported,
    Invalid,
    Config,
    Io,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Conflict(_) => ErrorKind::Conflict,
            StorageError::AuthFailure(_) => ErrorKind::AuthFailure,
            StorageError::Network(_) => ErrorKind::Network,
            StorageError::Encoding(_) => ErrorKind::Encoding,
            StorageError::Unsupported(_) => ErrorKind::Unsupported,
            StorageError::Invalid(_) => ErrorKind::Invalid,
            StorageError::Config(_) => ErrorKind::Config,
            StorageError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Encoding(format!("invalid JSON: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            StorageError::NotFound("a.smm".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            StorageError::Network("timed out".into()).kind(),
            ErrorKind::Network
        );
        assert!(StorageError::Conflict("a.smm".into()).is_conflict());
        assert!(!StorageError::Io("disk".into()).is_not_found());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AuthFailure).unwrap();
        assert_eq!(json, "\"auth_failure\"");
    }
}
