//! Convergent document engine for one note.
//!
//! A note's content is modelled as a set of live insert operations plus
//! a tombstone set of permanently deleted operation ids. Applying the
//! same operation set in any order yields identical rendered content:
//!
//! - deletes tombstone their target unconditionally, and a tombstoned id
//!   can never be resurrected by a late or replayed insert;
//! - duplicate/retransmitted inserts for the same id resolve by
//!   last-writer-wins on the originating device's own counter;
//! - rendering sorts by `(position, id)`, so equal positions break ties
//!   on the operation id rather than arrival order.
//!
//! The position integer is not a sequence CRDT: concurrent inserts at
//! the same position converge deterministically but are not merged
//! semantically. That limitation is inherent to the data model and is
//! kept as-is.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::VectorClock;

/// Device id attributed to baseline content loaded from persistence.
pub const SEED_DEVICE_ID: &str = "__server__";

/// The two edit kinds a client can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Delete,
}

/// An atomic edit, immutable once created. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Inserted text; `None` for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub position: i64,
    /// Causal snapshot of the originating device's clock.
    pub vector: BTreeMap<String, u64>,
    pub device_id: String,
    pub note_id: String,
}

impl Operation {
    /// The originating device's own counter — the last-writer-wins key.
    pub fn own_counter(&self) -> u64 {
        self.vector.get(&self.device_id).copied().unwrap_or(0)
    }

    /// Byte length of the edit's content, used for the reprocess
    /// threshold check.
    pub fn change_size(&self) -> usize {
        self.content.as_ref().map_or(0, |c| c.len())
    }
}

/// Rendered view of a document: linearized content plus the merged
/// causal clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub clock: BTreeMap<String, u64>,
}

/// Live operation set, tombstones, and merged clock for one note.
///
/// Not internally synchronized; a room serializes all access.
#[derive(Debug)]
pub struct NoteDocument {
    note_id: String,
    live: HashMap<String, Operation>,
    tombstones: HashSet<String>,
    clock: VectorClock,
}

impl NoteDocument {
    /// Create an empty document for `note_id`.
    pub fn new(note_id: impl Into<String>) -> Self {
        Self {
            note_id: note_id.into(),
            live: HashMap::new(),
            tombstones: HashSet::new(),
            clock: VectorClock::new(),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    /// Initialize an empty document from previously persisted content.
    ///
    /// The content becomes a single baseline insert at position 0,
    /// attributed to [`SEED_DEVICE_ID`], so re-activated documents flow
    /// through the same render path as live edits.
    pub fn seed(&mut self, content: String) {
        if content.is_empty() {
            return;
        }
        let op = self.generate_operation(OperationKind::Insert, Some(content), 0, SEED_DEVICE_ID);
        self.apply(&op);
    }

    /// Apply one operation and return the resulting rendered state.
    ///
    /// Idempotent: re-applying an operation never changes the outcome.
    pub fn apply(&mut self, op: &Operation) -> DocumentSnapshot {
        self.clock.merge(&op.vector);

        // Deletes are permanent. A late insert for a tombstoned id is
        // absorbed as a no-op rather than resurrecting the content.
        if self.tombstones.contains(&op.id) {
            return self.render();
        }

        match op.kind {
            OperationKind::Insert => {
                let admit = match self.live.get(&op.id) {
                    None => true,
                    Some(stored) => {
                        match stored.vector.get(&op.device_id).copied() {
                            Some(counter) => op.own_counter() > counter,
                            // Stored version has never seen this device.
                            None => true,
                        }
                    }
                };
                if admit {
                    self.live.insert(op.id.clone(), op.clone());
                }
            }
            OperationKind::Delete => {
                self.live.remove(&op.id);
                self.tombstones.insert(op.id.clone());
            }
        }

        self.render()
    }

    /// Deterministic linearization of the live set.
    ///
    /// Primary key is `position`, tie-break is `id`, giving a total
    /// order and therefore identical content on every replica that has
    /// applied the same operation set.
    pub fn render(&self) -> DocumentSnapshot {
        let mut ops: Vec<&Operation> = self.live.values().collect();
        ops.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        let content: String = ops.iter().filter_map(|op| op.content.as_deref()).collect();
        DocumentSnapshot {
            content,
            clock: self.clock.snapshot(),
        }
    }

    /// Produce a fresh locally-authored operation.
    ///
    /// Allocates a random UUID id (collisions across devices are
    /// effectively impossible), bumps the device's clock entry, and
    /// stamps the note id. The operation is not applied.
    pub fn generate_operation(
        &mut self,
        kind: OperationKind,
        content: Option<String>,
        position: i64,
        device_id: &str,
    ) -> Operation {
        Operation {
            id: Uuid::new_v4().to_string(),
            kind,
            content,
            position,
            vector: self.clock.increment(device_id),
            device_id: device_id.to_string(),
            note_id: self.note_id.clone(),
        }
    }

    /// Produce a delete targeting an existing operation id.
    ///
    /// Unlike inserts, a delete's id names its target, not a new edit.
    pub fn generate_delete(&mut self, target_id: impl Into<String>, device_id: &str) -> Operation {
        Operation {
            id: target_id.into(),
            kind: OperationKind::Delete,
            content: None,
            position: 0,
            vector: self.clock.increment(device_id),
            device_id: device_id.to_string(),
            note_id: self.note_id.clone(),
        }
    }

    /// Fold a remote clock snapshot into this document's clock.
    pub fn merge_clock(&mut self, other: &BTreeMap<String, u64>) {
        self.clock.merge(other);
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Number of currently visible operations.
    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    /// Whether `id` has been permanently deleted.
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }
}
