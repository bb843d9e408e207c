//! Save scheduling and storage orchestration for the mind map editor.
//!
//! - `SaveScheduler`: single-flight writer with an auto-save timer and conflict handling
//! - `SyncOrchestrator`: mode selection, load with fallback, patch persistence, notifications
//! - `ConfigStore`: the persisted configuration record
//! - `BackendProvider`: builds the backend for a storage mode

mod document;
mod notify;
mod orchestrator;
mod provider;
mod scheduler;
mod store;

pub use document::{DocumentSnapshot, SharedDocument};
pub use notify::{ChannelNotifier, Notifier, StorageEvent, TracingNotifier};
pub use orchestrator::SyncOrchestrator;
pub use provider::{BackendProvider, FixedBackends};
pub use scheduler::{
    ConflictInfo, ConflictResolution, SaveIntent, SaveScheduler, SchedulerEvent,
    SchedulerHandle, SchedulerSettings, SchedulerState,
};
pub use store::{ConfigStore, JsonFileConfigStore, MemoryConfigStore};
