//! Outbound notification channel for the UI.

use mindmap_storage_core::{ErrorKind, StorageError, VersionToken};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Fire-and-forget event for UI consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    StorageError { kind: ErrorKind, message: String },
    DirtyStateChanged(bool),
    Saved {
        path: String,
        version_token: Option<VersionToken>,
    },
}

impl StorageEvent {
    pub fn error(error: &StorageError) -> Self {
        StorageEvent::StorageError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Receiver of storage events. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: StorageEvent);
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<StorageEvent>,
}

impl ChannelNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StorageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: StorageEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.tx.send(event);
    }
}

/// Logs events; used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: StorageEvent) {
        match event {
            StorageEvent::StorageError { kind, message } => {
                warn!(?kind, "Storage error: {}", message)
            }
            StorageEvent::DirtyStateChanged(dirty) => info!(dirty, "Document dirty state changed"),
            StorageEvent::Saved {
                path,
                version_token,
            } => info!(%path, ?version_token, "Document saved"),
        }
    }
}
