//! Core traits and types for mind map storage backends.
//!
//! This crate defines the abstractions shared between the local, host-managed and
//! remote storage implementations:
//! - `StorageBackend`: get/put/delete/list against one storage variant
//! - `codec`: lossless text <-> wire-safe payload conversion
//! - `LocalCollaborator` / `HostCollaborator`: synchronous persistence owned by the embedder
//! - `MemoryBackend`: in-memory versioned backend for tests and offline use

mod backend;
pub mod codec;
mod collaborator;
mod config;
mod document;
mod error;
mod memory;

pub use backend::{DocumentEntry, StorageBackend};
pub use collaborator::{HostCollaborator, HostManagedBackend, LocalBackend, LocalCollaborator};
pub use config::{AppConfig, BackendConfig};
pub use document::{
    default_document, Document, StorageMode, VersionToken, DEFAULT_DOCUMENT_PATH,
    DOCUMENT_EXTENSION,
};
pub use error::{ErrorKind, StorageError, SyncResult};
pub use memory::{MemoryBackend, WriteCall};
