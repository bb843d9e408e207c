use std::sync::Arc;

use mindmap_storage_core::{BackendConfig, StorageBackend, StorageError, StorageMode, SyncResult};

/// Builds the backend for a storage mode.
///
/// The orchestrator never constructs backends itself, so tests and embedders can inject
/// their own implementations.
pub trait BackendProvider: Send + Sync {
    fn backend(
        &self,
        mode: StorageMode,
        config: &BackendConfig,
    ) -> SyncResult<Arc<dyn StorageBackend>>;
}

/// Provider with one prebuilt backend per mode.
#[derive(Clone, Default)]
pub struct FixedBackends {
    pub local: Option<Arc<dyn StorageBackend>>,
    pub remote: Option<Arc<dyn StorageBackend>>,
    pub host: Option<Arc<dyn StorageBackend>>,
}

impl BackendProvider for FixedBackends {
    fn backend(
        &self,
        mode: StorageMode,
        _config: &BackendConfig,
    ) -> SyncResult<Arc<dyn StorageBackend>> {
        let backend = match mode {
            StorageMode::Local => self.local.clone(),
            StorageMode::RemoteVersioned => self.remote.clone(),
            StorageMode::HostManaged => self.host.clone(),
        };
        backend.ok_or_else(|| {
            StorageError::Unsupported(format!("no backend available for {} mode", mode))
        })
    }
}
