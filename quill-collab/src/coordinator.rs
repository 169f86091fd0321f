//! Room registry, routing, and fan-out.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!              ├── Room (note_id) ── NoteDocument
//! Session B ──┘         │
//!                       ├── NoteStore   (load on activate, save on evict)
//!                       └── Reprocessor (fire-and-forget on large edits)
//! ```
//!
//! One `SyncCoordinator` instance owns the process-wide room registry.
//! It is always passed by reference into handlers, never reached
//! through a global, so lifetime and concurrency are testable in
//! isolation.
//!
//! Concurrency discipline:
//! - all mutation of one room's document and membership happens under
//!   that room's mutex — a single logical writer per note;
//! - the registry lock is a brief, note-independent critical section;
//!   rooms for different notes never serialize against each other;
//! - lock order is registry before room wherever both are held;
//! - no lock is ever held across a collaborator await or a send that
//!   could block: session sends are non-blocking `try_send`;
//! - an evicted room's content is recorded as a pending save before the
//!   registry entry disappears, so a re-activation racing the store
//!   write still seeds from the freshest content.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::engine::{DocumentSnapshot, NoteDocument};
use crate::hooks::{NoteStore, NullReprocessor, NullStore, Reprocessor};
use crate::protocol::{ClientMessage, ServerMessage};

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Outbound buffer per session. A session that falls this far
    /// behind is treated as dead and removed.
    pub session_buffer: usize,
    /// Operation content length above which the reprocess hook fires.
    pub reprocess_threshold: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session_buffer: 256,
            reprocess_threshold: 100,
        }
    }
}

/// One connected client, owned by the room it is a member of.
///
/// The handle wraps the sending half of the session's outbound channel;
/// the transport layer drains the receiving half into the socket.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub device_id: String,
    tx: mpsc::Sender<ServerMessage>,
}

impl SessionHandle {
    /// Create a handle plus the receiver the transport should drain.
    pub fn new(device_id: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                session_id: Uuid::new_v4(),
                device_id: device_id.into(),
                tx,
            },
            rx,
        )
    }

    /// Non-blocking delivery. A full or closed channel counts as a dead
    /// peer; returns whether the message was accepted.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }
}

struct RoomInner {
    document: NoteDocument,
    members: HashMap<Uuid, SessionHandle>,
    /// Set when the room is evicted from the registry. A session that
    /// looked the room up before eviction must not join it.
    closed: bool,
}

impl RoomInner {
    /// Send to every member except `exclude`; returns the ids whose
    /// channel rejected the message.
    fn fan_out(&self, message: &ServerMessage, exclude: Option<Uuid>) -> Vec<Uuid> {
        let mut dead = Vec::new();
        for (id, member) in &self.members {
            if Some(*id) == exclude {
                continue;
            }
            if !member.send(message.clone()) {
                dead.push(*id);
            }
        }
        dead
    }

    fn remove_dead(&mut self, dead: &[Uuid], note_id: &str) {
        for id in dead {
            if self.members.remove(id).is_some() {
                log::warn!("session {id} unreachable, removed from note {note_id}");
            }
        }
    }
}

/// Live synchronization context for one note: its document plus the
/// currently connected sessions.
pub struct Room {
    note_id: String,
    inner: Mutex<RoomInner>,
}

impl Room {
    fn new(note_id: &str, seed: Option<String>) -> Self {
        let mut document = NoteDocument::new(note_id);
        if let Some(content) = seed {
            document.seed(content);
        }
        Self {
            note_id: note_id.to_string(),
            inner: Mutex::new(RoomInner {
                document,
                members: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    pub async fn snapshot(&self) -> DocumentSnapshot {
        self.inner.lock().await.document.render()
    }
}

/// Process-wide registry of rooms; routes operations, manages room
/// lifecycle, and performs fan-out.
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Evicted content not yet confirmed written by the store, keyed by
    /// note id. Entries are inserted under the registry write lock and
    /// removed by the save task once the store write lands; activation
    /// reads them ahead of `NoteStore::load`.
    pending_saves: Arc<Mutex<HashMap<String, String>>>,
    store: Arc<dyn NoteStore>,
    reprocessor: Arc<dyn Reprocessor>,
}

impl SyncCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn NoteStore>,
        reprocessor: Arc<dyn Reprocessor>,
    ) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            pending_saves: Arc::new(Mutex::new(HashMap::new())),
            store,
            reprocessor,
        }
    }

    /// No persistence, no reprocessing, default tuning.
    pub fn with_defaults() -> Self {
        Self::new(
            CoordinatorConfig::default(),
            Arc::new(NullStore),
            Arc::new(NullReprocessor),
        )
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_notes(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Rendered state of a note's room, if one is active.
    pub async fn note_state(&self, note_id: &str) -> Option<DocumentSnapshot> {
        let room = self.rooms.read().await.get(note_id).cloned()?;
        Some(room.snapshot().await)
    }

    /// Register `session` as a member of the note's room, creating the
    /// room lazily on first connection.
    ///
    /// A fresh room seeds its document from the note store's last known
    /// content; document state is not retained in memory between active
    /// periods. The session receives a full `initial_state` snapshot
    /// before any later operation can be interleaved.
    pub async fn connect(&self, session: SessionHandle, note_id: &str) {
        loop {
            let room = self.get_or_create_room(note_id).await;
            let mut inner = room.inner.lock().await;
            if inner.closed {
                // Evicted between lookup and lock; re-create.
                continue;
            }

            let session_id = session.session_id;
            let state = inner.document.render();
            let delivered = session.send(ServerMessage::InitialState { state });
            if delivered {
                inner.members.insert(session_id, session);
                log::debug!(
                    "session {session_id} joined note {note_id} ({} members)",
                    inner.members.len()
                );
            } else {
                log::warn!("session {session_id} dropped before initial state for note {note_id}");
            }
            let emptied = !delivered && inner.members.is_empty();
            drop(inner);

            if emptied {
                self.evict_if_empty(note_id).await;
            }
            return;
        }
    }

    /// Remove the session from the note's room. Unconditional and
    /// immediate; never waits on in-flight operations.
    ///
    /// Membership check and registry removal happen under the same
    /// locks, so a connection arriving concurrently either joins before
    /// the room empties or re-creates the room after eviction.
    pub async fn disconnect(&self, session_id: Uuid, note_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(note_id).cloned() else {
            return;
        };
        let mut inner = room.inner.lock().await;
        if inner.members.remove(&session_id).is_some() {
            log::debug!("session {session_id} left note {note_id}");
        }
        if inner.members.is_empty() && !inner.closed {
            inner.closed = true;
            rooms.remove(note_id);
            let content = inner.document.render().content;
            self.queue_save(note_id, content).await;
            drop(inner);
            drop(rooms);
            log::info!("room {note_id} evicted (last member left)");
        }
    }

    /// Apply one client operation to the note's room, then fan out the
    /// merged state to the other members and acknowledge the sender.
    ///
    /// Validation happens before the room is touched; a rejected frame
    /// produces an `error` message for the sender only. An unknown note
    /// id implicitly activates a room, mirroring connect.
    pub async fn handle_operation(
        &self,
        session: &SessionHandle,
        note_id: &str,
        message: ClientMessage,
    ) {
        let op = match message.into_operation(note_id) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("rejected operation for note {note_id}: {e}");
                let _ = session.send(ServerMessage::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        loop {
            let room = self.get_or_create_room(note_id).await;
            let mut inner = room.inner.lock().await;
            if inner.closed {
                continue;
            }

            let state = inner.document.apply(&op);

            let mut dead = inner.fan_out(
                &ServerMessage::Operation {
                    operation: op.clone(),
                    state: state.clone(),
                },
                Some(session.session_id),
            );
            if !session.send(ServerMessage::Acknowledge {
                operation_id: op.id.clone(),
                state: state.clone(),
            }) {
                dead.push(session.session_id);
            }
            inner.remove_dead(&dead, note_id);

            // Covers both a sender that died mid-operation and a room
            // activated by an operation from a never-connected sender;
            // either way nobody is left to keep the room alive.
            let emptied = inner.members.is_empty();
            let reprocess = op.change_size() > self.config.reprocess_threshold;
            drop(inner);

            if emptied {
                self.evict_if_empty(note_id).await;
            }
            if reprocess {
                let reprocessor = self.reprocessor.clone();
                let note_id = note_id.to_string();
                let content = state.content;
                tokio::spawn(async move {
                    reprocessor.reprocess(note_id, content).await;
                });
            }
            return;
        }
    }

    /// Deliver `message` to every current member of the note's room
    /// except `exclude`. Members whose send fails are removed; one
    /// broken peer never aborts delivery to the rest.
    pub async fn broadcast(&self, note_id: &str, message: ServerMessage, exclude: Option<Uuid>) {
        let room = self.rooms.read().await.get(note_id).cloned();
        let Some(room) = room else {
            return;
        };
        let mut inner = room.inner.lock().await;
        if inner.closed {
            return;
        }
        let dead = inner.fan_out(&message, exclude);
        inner.remove_dead(&dead, note_id);
        let emptied = inner.members.is_empty();
        drop(inner);

        if emptied {
            self.evict_if_empty(note_id).await;
        }
    }

    async fn get_or_create_room(&self, note_id: &str) -> Arc<Room> {
        // Fast path: read lock only.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(note_id) {
                return room.clone();
            }
        }

        // An in-flight eviction save has fresher content than the
        // store; prefer it. Then load before taking the write lock so
        // the registry critical section stays brief; the loser of a
        // racing insert discards its loaded content.
        let seed = {
            let pending = self.pending_saves.lock().await;
            pending.get(note_id).cloned()
        };
        let seed = match seed {
            Some(content) => Some(content),
            None => self.store.load(note_id).await,
        };

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(note_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(note_id, seed));
        rooms.insert(note_id.to_string(), room.clone());
        log::info!("room {note_id} activated");
        room
    }

    /// Atomic check-and-remove for rooms emptied outside the disconnect
    /// path (e.g. every member failed during a fan-out).
    async fn evict_if_empty(&self, note_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(note_id).cloned() else {
            return;
        };
        let mut inner = room.inner.lock().await;
        if !inner.members.is_empty() || inner.closed {
            return;
        }
        inner.closed = true;
        rooms.remove(note_id);
        let content = inner.document.render().content;
        self.queue_save(note_id, content).await;
        drop(inner);
        drop(rooms);
        log::info!("room {note_id} evicted (no reachable members)");
    }

    /// Record evicted content as pending and make sure a save task is
    /// running for the note. Saves for one note are serialized: a
    /// running task re-reads the pending entry after each store write
    /// and keeps going until the entry it wrote is still the latest, so
    /// an older in-flight write can never clobber a newer one.
    async fn queue_save(&self, note_id: &str, content: String) {
        let mut pending = self.pending_saves.lock().await;
        match pending.entry(note_id.to_string()) {
            Entry::Occupied(mut entry) => {
                // A save task is active; it picks this up after the
                // write in progress completes.
                entry.insert(content);
            }
            Entry::Vacant(entry) => {
                entry.insert(content);
                let store = self.store.clone();
                let pending_saves = self.pending_saves.clone();
                let note_id = note_id.to_string();
                tokio::spawn(async move {
                    loop {
                        let content = {
                            let pending = pending_saves.lock().await;
                            match pending.get(&note_id) {
                                Some(content) => content.clone(),
                                None => break,
                            }
                        };
                        store.save(note_id.clone(), content.clone()).await;
                        let mut pending = pending_saves.lock().await;
                        match pending.get(&note_id) {
                            Some(latest) if *latest == content => {
                                pending.remove(&note_id);
                                break;
                            }
                            Some(_) => continue,
                            None => break,
                        }
                    }
                });
            }
        }
    }
}
