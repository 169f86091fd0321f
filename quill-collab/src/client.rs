//! WebSocket sync client for a single note.
//!
//! Wraps one connection to the sync server and surfaces everything the
//! server pushes as [`SyncEvent`]s on a channel the application drains.
//! The server's rendered state is authoritative: every push carries a
//! full [`DocumentSnapshot`], and [`SyncClient::content`] reports the
//! latest one. A local [`NoteDocument`] exists to generate causally
//! stamped operations, not to re-derive content — the wire's initial
//! state carries rendered text only, so the live operation set behind
//! remote edits is not reconstructible client-side.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::engine::{DocumentSnapshot, NoteDocument, Operation, OperationKind};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Full state snapshot received on join
    InitialState(DocumentSnapshot),
    /// A remote peer's operation plus the merged state it produced
    RemoteOperation {
        operation: Operation,
        state: DocumentSnapshot,
    },
    /// The server confirmed one of our own operations
    Acknowledged {
        operation_id: String,
        state: DocumentSnapshot,
    },
    /// The server rejected a frame we sent
    ServerError(String),
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    note_id: String,
    device_id: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Latest snapshot pushed by the server
    remote_state: Arc<RwLock<DocumentSnapshot>>,
    /// Local document used to stamp fresh operations
    document: Arc<Mutex<NoteDocument>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client for one note on one device.
    pub fn new(
        server_url: impl Into<String>,
        note_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        let note_id = note_id.into();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            document: Arc::new(Mutex::new(NoteDocument::new(note_id.clone()))),
            note_id,
            device_id: device_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            remote_state: Arc::new(RwLock::new(DocumentSnapshot::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing the socket.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/ws/{}?device_id={}",
            self.server_url, self.note_id, self.device_id
        );
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("connect to {url} failed: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: decode server pushes into events, track the
        // latest server snapshot, and fold clocks into the local
        // document so generated operations stay causally ahead.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let remote_state = self.remote_state.clone();
        let document = self.document.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let server_msg = match ServerMessage::decode(text.as_str()) {
                            Ok(server_msg) => server_msg,
                            Err(e) => {
                                log::warn!("undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let event = match server_msg {
                            ServerMessage::InitialState { state } => {
                                document.lock().await.merge_clock(&state.clock);
                                *remote_state.write().await = state.clone();
                                SyncEvent::InitialState(state)
                            }
                            ServerMessage::Operation { operation, state } => {
                                document.lock().await.apply(&operation);
                                *remote_state.write().await = state.clone();
                                SyncEvent::RemoteOperation { operation, state }
                            }
                            ServerMessage::Acknowledge {
                                operation_id,
                                state,
                            } => {
                                document.lock().await.merge_clock(&state.clock);
                                *remote_state.write().await = state.clone();
                                SyncEvent::Acknowledged {
                                    operation_id,
                                    state,
                                }
                            }
                            ServerMessage::Error { message } => SyncEvent::ServerError(message),
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Insert `content` at `position`: generates the operation, applies
    /// it locally, and sends it to the server. Returns the operation so
    /// the caller can track its id (e.g. for a later delete).
    pub async fn insert(
        &self,
        content: impl Into<String>,
        position: i64,
    ) -> Result<Operation, ProtocolError> {
        let op = {
            let mut doc = self.document.lock().await;
            let op = doc.generate_operation(
                OperationKind::Insert,
                Some(content.into()),
                position,
                &self.device_id,
            );
            doc.apply(&op);
            op
        };
        self.send_operation(&op).await?;
        Ok(op)
    }

    /// Delete a previously inserted operation by id.
    pub async fn delete(&self, target_id: impl Into<String>) -> Result<Operation, ProtocolError> {
        let op = {
            let mut doc = self.document.lock().await;
            let op = doc.generate_delete(target_id, &self.device_id);
            doc.apply(&op);
            op
        };
        self.send_operation(&op).await?;
        Ok(op)
    }

    async fn send_operation(&self, op: &Operation) -> Result<(), ProtocolError> {
        let frame = ClientMessage::from_operation(op).encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Content of the note as last reported by the server. Empty until
    /// the initial state arrives; catches up with local edits when
    /// their acknowledgements come back.
    pub async fn content(&self) -> String {
        self.remote_state.read().await.content.clone()
    }

    /// Latest full snapshot (content plus merged clock) pushed by the
    /// server.
    pub async fn server_state(&self) -> DocumentSnapshot {
        self.remote_state.read().await.clone()
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
