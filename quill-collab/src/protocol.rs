//! JSON wire protocol between editing clients and the sync server.
//!
//! Client → server, one operation per text frame:
//! ```json
//! {"type": "insert", "id": "...", "position": 0, "content": "Hi",
//!  "vector": {"deviceA": 1}, "device_id": "deviceA"}
//! {"type": "delete", "id": "...", "vector": {"deviceA": 2},
//!  "device_id": "deviceA"}
//! ```
//!
//! Server → client:
//! ```json
//! {"type": "initial_state", "state": {"content": "...", "clock": {}}}
//! {"type": "operation", "operation": {...}, "state": {...}}
//! {"type": "acknowledge", "operation_id": "...", "state": {...}}
//! {"type": "error", "message": "..."}
//! ```
//!
//! Malformed frames (unknown `type`, missing required field) fail to
//! deserialize here and never reach the document engine; the sender
//! gets an `error` message and the room is untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::{DocumentSnapshot, Operation, OperationKind};

/// An operation submitted by a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Insert {
        id: String,
        position: i64,
        content: String,
        vector: BTreeMap<String, u64>,
        device_id: String,
    },
    Delete {
        id: String,
        vector: BTreeMap<String, u64>,
        device_id: String,
    },
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Build the wire form of a locally generated operation.
    pub fn from_operation(op: &Operation) -> Self {
        match op.kind {
            OperationKind::Insert => ClientMessage::Insert {
                id: op.id.clone(),
                position: op.position,
                content: op.content.clone().unwrap_or_default(),
                vector: op.vector.clone(),
                device_id: op.device_id.clone(),
            },
            OperationKind::Delete => ClientMessage::Delete {
                id: op.id.clone(),
                vector: op.vector.clone(),
                device_id: op.device_id.clone(),
            },
        }
    }

    /// Validate and convert into an engine operation for `note_id`.
    ///
    /// Rejects operations with an empty id or device id, and inserts
    /// whose vector lacks an entry for the originating device (the
    /// last-writer-wins key would be meaningless without it).
    pub fn into_operation(self, note_id: &str) -> Result<Operation, ProtocolError> {
        let (id, kind, content, position, vector, device_id) = match self {
            ClientMessage::Insert {
                id,
                position,
                content,
                vector,
                device_id,
            } => (id, OperationKind::Insert, Some(content), position, vector, device_id),
            ClientMessage::Delete {
                id,
                vector,
                device_id,
            } => (id, OperationKind::Delete, None, 0, vector, device_id),
        };

        if id.is_empty() {
            return Err(ProtocolError::InvalidOperation("empty operation id".into()));
        }
        if device_id.is_empty() {
            return Err(ProtocolError::InvalidOperation("empty device id".into()));
        }
        if kind == OperationKind::Insert && !vector.contains_key(&device_id) {
            return Err(ProtocolError::InvalidOperation(format!(
                "vector missing entry for originating device {device_id}"
            )));
        }

        Ok(Operation {
            id,
            kind,
            content,
            position,
            vector,
            device_id,
            note_id: note_id.to_string(),
        })
    }
}

/// A message pushed from the sync server to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full current state, sent once when a session joins a room.
    InitialState { state: DocumentSnapshot },
    /// A peer's operation plus the merged state it produced.
    Operation {
        operation: Operation,
        state: DocumentSnapshot,
    },
    /// Confirmation to the sender; `state` reflects the sender's own
    /// just-applied operation.
    Acknowledge {
        operation_id: String,
        state: DocumentSnapshot,
    },
    /// Boundary rejection of a malformed or invalid frame.
    Error { message: String },
}

impl ServerMessage {
    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// The frame was not a well-formed protocol message.
    Malformed(String),
    /// The frame parsed but described an unusable operation.
    InvalidOperation(String),
    /// The underlying connection is gone.
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed message: {e}"),
            Self::InvalidOperation(e) => write!(f, "invalid operation: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
