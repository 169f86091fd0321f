//! WebSocket sync server.
//!
//! Each client opens one connection per note at `/ws/{note_id}`, with
//! its device identity in the `device_id` query parameter. The server
//! binds the connection to a session handle, registers it with the
//! coordinator, and then pumps frames both ways:
//!
//! ```text
//! Client A ──┐
//!             ├── SyncCoordinator ── Room (note_id) ── NoteDocument
//! Client B ──┘            │
//!                         ├── NoteStore
//!                         └── Reprocessor
//! ```
//!
//! Inbound text frames are parsed as operations and routed through the
//! coordinator; a frame that fails to parse gets an `error` message and
//! the connection stays up. Outbound messages arrive on the session's
//! channel and are written to the socket; close or socket error tears
//! the session down via `disconnect`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coordinator::{CoordinatorConfig, SessionHandle, SyncCoordinator};
use crate::hooks::{NoteStore, NullReprocessor, NullStore, Reprocessor};
use crate::protocol::{ClientMessage, ServerMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound buffer per session
    pub session_buffer: usize,
    /// Operation content length above which the reprocess hook fires
    pub reprocess_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session_buffer: 256,
            reprocess_threshold: 100,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The sync server: an accept loop in front of one [`SyncCoordinator`].
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<SyncCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server wired to the given collaborators.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn NoteStore>,
        reprocessor: Arc<dyn Reprocessor>,
    ) -> Self {
        let coordinator = Arc::new(SyncCoordinator::new(
            CoordinatorConfig {
                session_buffer: config.session_buffer,
                reprocess_threshold: config.reprocess_threshold,
            },
            store,
            reprocessor,
        ));
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Default configuration, no persistence, no reprocessing.
    pub fn with_defaults() -> Self {
        Self::new(
            ServerConfig::default(),
            Arc::new(NullStore),
            Arc::new(NullReprocessor),
        )
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop; call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let buffer = self.config.session_buffer;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, coordinator, stats, buffer).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.coordinator.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the coordinator backing this server.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}

/// Handle a single WebSocket connection end to end.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    coordinator: Arc<SyncCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
    buffer: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Capture the request target during the upgrade handshake.
    let mut target = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, response: Response| {
        target = req.uri().to_string();
        Ok(response)
    })
    .await?;

    let Some((note_id, device_id)) = parse_target(&target) else {
        log::warn!("rejecting connection from {addr}: bad target {target:?}");
        return Ok(());
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (session, mut outgoing) = SessionHandle::new(device_id, buffer);
    let session_id = session.session_id;

    log::info!("session {session_id} connected from {addr} for note {note_id}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    coordinator.connect(session.clone(), &note_id).await;

    loop {
        tokio::select! {
            // Inbound frame from the client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                        }
                        match ClientMessage::decode(text.as_str()) {
                            Ok(operation) => {
                                coordinator.handle_operation(&session, &note_id, operation).await;
                            }
                            Err(e) => {
                                log::warn!("malformed frame from session {session_id}: {e}");
                                let _ = session.send(ServerMessage::Error {
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::debug!("websocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Outbound message for this session
            out = outgoing.recv() => {
                let Some(message) = out else { break };
                match message.encode() {
                    Ok(frame) => {
                        if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to encode outbound message: {e}"),
                }
            }
        }
    }

    coordinator.disconnect(session_id, &note_id).await;
    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
    }
    log::info!("session {session_id} disconnected from note {note_id}");

    Ok(())
}

/// Extract `(note_id, device_id)` from a request target of the form
/// `/ws/{note_id}?device_id=...`. Both values are percent-decoded, so
/// `/ws/note%201` and a note id of `note 1` name the same room. A
/// missing device id gets a random one; a missing or empty note id, or
/// an invalid percent escape, rejects the connection.
fn parse_target(target: &str) -> Option<(String, String)> {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let note_id = percent_decode(path.strip_prefix("/ws/")?.trim_matches('/'))?;
    if note_id.is_empty() {
        return None;
    }

    let mut device_id = None;
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == "device_id" && !value.is_empty() {
                    device_id = Some(percent_decode(value)?);
                }
            }
        }
    }

    Some((
        note_id,
        device_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
    ))
}

/// Decode `%XX` percent escapes; the result must be valid UTF-8.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hi = (hex[0] as char).to_digit(16)?;
            let lo = (hex[1] as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.session_buffer, 256);
        assert_eq!(config.reprocess_threshold, 100);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[test]
    fn test_parse_target_with_device() {
        let (note_id, device_id) = parse_target("/ws/n1?device_id=deviceA").unwrap();
        assert_eq!(note_id, "n1");
        assert_eq!(device_id, "deviceA");
    }

    #[test]
    fn test_parse_target_without_device_gets_random() {
        let (note_id, device_id) = parse_target("/ws/n1").unwrap();
        assert_eq!(note_id, "n1");
        assert!(!device_id.is_empty());
    }

    #[test]
    fn test_parse_target_trailing_slash() {
        let (note_id, _) = parse_target("/ws/n1/").unwrap();
        assert_eq!(note_id, "n1");
    }

    #[test]
    fn test_parse_target_extra_query_params() {
        let (note_id, device_id) = parse_target("/ws/n1?token=abc&device_id=d1").unwrap();
        assert_eq!(note_id, "n1");
        assert_eq!(device_id, "d1");
    }

    #[test]
    fn test_parse_target_rejects_bad_paths() {
        assert!(parse_target("/").is_none());
        assert!(parse_target("/ws/").is_none());
        assert!(parse_target("/other/n1").is_none());
        assert!(parse_target("/ws/?device_id=x").is_none());
    }

    #[test]
    fn test_parse_target_percent_decodes() {
        let (note_id, device_id) = parse_target("/ws/note%201?device_id=dev%2Fa").unwrap();
        assert_eq!(note_id, "note 1");
        assert_eq!(device_id, "dev/a");

        // Escaped and literal spellings name the same room.
        let (escaped, _) = parse_target("/ws/note%201").unwrap();
        let (literal, _) = parse_target("/ws/note 1").unwrap();
        assert_eq!(escaped, literal);
    }

    #[test]
    fn test_parse_target_rejects_invalid_escapes() {
        assert!(parse_target("/ws/note%zz").is_none());
        assert!(parse_target("/ws/note%2").is_none());
        // Decodes to a byte sequence that is not UTF-8.
        assert!(parse_target("/ws/n1?device_id=a%FFb").is_none());
    }
}
