//! Seams to the external collaborators the sync core depends on.
//!
//! The synchronization path only ever touches two outside services:
//! a note store that supplies content when a room activates and takes
//! final content when it evicts, and a reprocessing pipeline poked when
//! a single edit is large enough to warrant re-analysis. Both are
//! best-effort from the room's point of view: a failing collaborator is
//! logged and never fails or delays the sync operation that invoked it.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, RwLock};

/// Persistence collaborator for note content.
pub trait NoteStore: Send + Sync {
    /// Last persisted content for `note_id`, or `None` if the note has
    /// never been saved. Awaited once per room activation.
    fn load(&self, note_id: &str) -> BoxFuture<'static, Option<String>>;

    /// Persist final content on room eviction. Best-effort: callers
    /// spawn this and never wait on the outcome.
    fn save(&self, note_id: String, content: String) -> BoxFuture<'static, ()>;
}

/// Content-analysis collaborator, invoked fire-and-forget when an
/// edit's size crosses the configured threshold.
pub trait Reprocessor: Send + Sync {
    fn reprocess(&self, note_id: String, content: String) -> BoxFuture<'static, ()>;
}

/// Store that retains nothing; every room activates empty.
#[derive(Debug, Default)]
pub struct NullStore;

impl NoteStore for NullStore {
    fn load(&self, _note_id: &str) -> BoxFuture<'static, Option<String>> {
        Box::pin(async { None })
    }

    fn save(&self, note_id: String, _content: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            log::debug!("discarding final content for note {note_id}");
        })
    }
}

/// Reprocessor that ignores every trigger.
#[derive(Debug, Default)]
pub struct NullReprocessor;

impl Reprocessor for NullReprocessor {
    fn reprocess(&self, _note_id: String, _content: String) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// In-memory note store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    notes: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read, bypassing the collaborator interface.
    pub async fn get(&self, note_id: &str) -> Option<String> {
        self.notes.read().await.get(note_id).cloned()
    }

    /// Direct write, bypassing the collaborator interface.
    pub async fn put(&self, note_id: impl Into<String>, content: impl Into<String>) {
        self.notes.write().await.insert(note_id.into(), content.into());
    }
}

impl NoteStore for MemoryStore {
    fn load(&self, note_id: &str) -> BoxFuture<'static, Option<String>> {
        let notes = self.notes.clone();
        let note_id = note_id.to_string();
        Box::pin(async move { notes.read().await.get(&note_id).cloned() })
    }

    fn save(&self, note_id: String, content: String) -> BoxFuture<'static, ()> {
        let notes = self.notes.clone();
        Box::pin(async move {
            log::debug!("persisting {} bytes for note {note_id}", content.len());
            notes.write().await.insert(note_id, content);
        })
    }
}

/// Reprocessor that records every invocation on a channel.
#[derive(Debug, Clone)]
pub struct RecordingReprocessor {
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl RecordingReprocessor {
    /// Returns the reprocessor and the receiver of `(note_id, content)`
    /// pairs, one per trigger.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reprocessor for RecordingReprocessor {
    fn reprocess(&self, note_id: String, content: String) -> BoxFuture<'static, ()> {
        let tx = self.tx.clone();
        Box::pin(async move {
            if tx.send((note_id, content)).is_err() {
                log::warn!("reprocess receiver dropped");
            }
        })
    }
}
