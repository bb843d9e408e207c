//! Last-known document snapshot shared between the orchestrator and the scheduler.

use std::sync::Arc;

use tokio::sync::watch;

/// Point-in-time view of the editor's document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub path: String,
    pub content: String,
    /// Bumped on every edit
    pub generation: u64,
    /// Generation last confirmed persisted
    pub saved_generation: u64,
}

impl DocumentSnapshot {
    pub fn is_dirty(&self) -> bool {
        self.generation != self.saved_generation
    }
}

/// Cloneable handle to the current snapshot; observers can subscribe to changes.
#[derive(Debug, Clone)]
pub struct SharedDocument {
    tx: Arc<watch::Sender<DocumentSnapshot>>,
}

impl SharedDocument {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(DocumentSnapshot {
            path: path.into(),
            content: content.into(),
            generation: 0,
            saved_generation: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DocumentSnapshot> {
        self.tx.subscribe()
    }

    pub fn is_dirty(&self) -> bool {
        self.tx.borrow().is_dirty()
    }

    /// Replace the content with a freshly loaded (clean) document.
    pub fn load(&self, path: &str, content: String) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|snapshot| {
            snapshot.path = path.to_string();
            snapshot.content = content;
            snapshot.generation += 1;
            snapshot.saved_generation = snapshot.generation;
            generation = snapshot.generation;
        });
        generation
    }

    /// Record an edit; the snapshot becomes dirty.
    pub fn edit(&self, content: String) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|snapshot| {
            snapshot.content = content;
            snapshot.generation += 1;
            generation = snapshot.generation;
        });
        generation
    }

    /// Derive new content from the current one in a single step; concurrent callers
    /// each see the other's result. Returns the edited snapshot.
    pub fn edit_with(&self, f: impl FnOnce(&str) -> String) -> DocumentSnapshot {
        let mut edited = None;
        self.tx.send_modify(|snapshot| {
            snapshot.content = f(&snapshot.content);
            snapshot.generation += 1;
            edited = Some(snapshot.clone());
        });
        edited.unwrap_or_else(|| self.snapshot())
    }

    /// Mark `generation` as persisted. Later edits stay dirty.
    pub fn mark_saved(&self, generation: u64) {
        self.tx.send_if_modified(|snapshot| {
            if generation > snapshot.saved_generation && generation <= snapshot.generation {
                snapshot.saved_generation = generation;
                true
            } else {
                false
            }
        });
    }
}
