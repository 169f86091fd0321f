//! # quill-collab — Real-time note synchronization core
//!
//! Merges concurrent edits to the same note from multiple devices into
//! a single convergent document and fans the result out to every active
//! viewer over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer      │
//! │ (per note)  │     JSON frames    │                 │
//! └──────┬──────┘                    └────────┬────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌─────────────────┐
//! │ NoteDocument│                    │ SyncCoordinator │
//! │ (mirror)    │                    │ (room registry) │
//! └─────────────┘                    └────────┬────────┘
//!                                             │
//!                                   ┌─────────┴─────────┐
//!                                   │ Room (note_id)    │
//!                                   │  NoteDocument     │
//!                                   │  member sessions  │
//!                                   └─────────┬─────────┘
//!                                             │
//!                                  ┌──────────┴──────────┐
//!                                  ▼                     ▼
//!                              NoteStore            Reprocessor
//!                         (load / save content)  (large-edit trigger)
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — per-device vector clocks with pointwise-max merge
//! - [`engine`] — operation/tombstone document model and rendering
//! - [`protocol`] — JSON wire messages and boundary validation
//! - [`hooks`] — persistence and reprocessing collaborator seams
//! - [`coordinator`] — room lifecycle, routing, and fan-out
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client

pub mod clock;
pub mod engine;
pub mod protocol;
pub mod hooks;
pub mod coordinator;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use clock::VectorClock;
pub use engine::{DocumentSnapshot, NoteDocument, Operation, OperationKind, SEED_DEVICE_ID};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use hooks::{
    MemoryStore, NoteStore, NullReprocessor, NullStore, RecordingReprocessor, Reprocessor,
};
pub use coordinator::{CoordinatorConfig, Room, SessionHandle, SyncCoordinator};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
