use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Opaque identifier for the state of a stored object, used for optimistic concurrency.
pub type VersionToken = String;

/// Path of the document the editor opens when nothing else is configured.
pub const DEFAULT_DOCUMENT_PATH: &str = "mindmap.smm";

/// Extension of files that hold mind map documents.
pub const DOCUMENT_EXTENSION: &str = ".smm";

/// Storage variants supported by the editor. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Local,
    RemoteVersioned,
    HostManaged,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageMode::Local => "local",
            StorageMode::RemoteVersioned => "remote_versioned",
            StorageMode::HostManaged => "host_managed",
        };
        f.write_str(name)
    }
}

/// A persisted (or to-be-persisted) document.
///
/// `content` is always plain Unicode text at this level; wire encodings never leak here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub content: String,
    /// `None` until the document has been persisted by a versioned backend.
    pub version_token: Option<VersionToken>,
}

impl Document {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            version_token: None,
        }
    }

    pub fn with_version(mut self, token: impl Into<VersionToken>) -> Self {
        self.version_token = Some(token.into());
        self
    }
}

/// Built-in tree shown when no document exists yet.
pub fn default_document() -> Value {
    json!({
        "root": {
            "data": { "text": "Root Node" },
            "children": []
        },
        "theme": {
            "template": "classic",
            "config": {}
        },
        "layout": "logicalStructure"
    })
}
