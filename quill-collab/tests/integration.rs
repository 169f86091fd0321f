//! End-to-end tests over a real WebSocket server.
//!
//! Each test boots a server on a free port, connects real clients, and
//! drives the full pipeline: connect → initial state → operations →
//! broadcast/acknowledge → eviction and persistence.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use quill_collab::client::{ConnectionState, SyncClient, SyncEvent};
use quill_collab::hooks::{MemoryStore, RecordingReprocessor};
use quill_collab::server::{ServerConfig, SyncServer};

type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestServer {
    url: String,
    store: MemoryStore,
    reprocess_rx: mpsc::UnboundedReceiver<(String, String)>,
}

/// Start a server on a free port with an in-memory store and a
/// recording reprocessor.
async fn start_test_server() -> TestServer {
    let port = free_port().await;
    let store = MemoryStore::new();
    let (reprocessor, reprocess_rx) = RecordingReprocessor::new();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        session_buffer: 64,
        reprocess_threshold: 100,
    };
    let server = SyncServer::new(config, Arc::new(store.clone()), Arc::new(reprocessor));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        store,
        reprocess_rx,
    }
}

/// Open a raw WebSocket for a note, bypassing the client layer.
async fn raw_connect(url: &str, note_id: &str, device_id: &str) -> WsConn {
    let target = format!("{url}/ws/{note_id}?device_id={device_id}");
    let (ws, _) = tokio_tungstenite::connect_async(target.as_str())
        .await
        .expect("websocket connect failed");
    ws
}

/// Read the next text frame as JSON.
async fn next_json(ws: &mut WsConn) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read frames until one carries `state.content == expected`.
async fn await_content(ws: &mut WsConn, expected: &str) -> serde_json::Value {
    for _ in 0..10 {
        let json = next_json(ws).await;
        if json["state"]["content"] == expected {
            return json;
        }
    }
    panic!("never observed content {expected:?}");
}

async fn send_json(ws: &mut WsConn, frame: &str) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send failed");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server().await;
    let target = format!("{}/ws/n1?device_id=deviceA", server.url);
    let result = tokio_tungstenite::connect_async(target.as_str()).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_connect_receives_initial_state() {
    let server = start_test_server().await;
    let mut ws = raw_connect(&server.url, "n1", "deviceA").await;

    let json = next_json(&mut ws).await;
    assert_eq!(json["type"], "initial_state");
    assert_eq!(json["state"]["content"], "");
}

#[tokio::test]
async fn test_insert_is_broadcast_and_acknowledged() {
    let server = start_test_server().await;
    let mut alice = raw_connect(&server.url, "n1", "deviceA").await;
    let mut bob = raw_connect(&server.url, "n1", "deviceB").await;
    let _ = next_json(&mut alice).await; // initial_state
    let _ = next_json(&mut bob).await; // initial_state

    send_json(
        &mut alice,
        r#"{"type": "insert", "id": "op1", "position": 0, "content": "Hi",
            "vector": {"deviceA": 1}, "device_id": "deviceA"}"#,
    )
    .await;

    let ack = next_json(&mut alice).await;
    assert_eq!(ack["type"], "acknowledge");
    assert_eq!(ack["operation_id"], "op1");
    assert_eq!(ack["state"]["content"], "Hi");
    assert_eq!(ack["state"]["clock"]["deviceA"], 1);

    let broadcast = next_json(&mut bob).await;
    assert_eq!(broadcast["type"], "operation");
    assert_eq!(broadcast["operation"]["id"], "op1");
    assert_eq!(broadcast["operation"]["type"], "insert");
    assert_eq!(broadcast["state"]["content"], "Hi");
}

#[tokio::test]
async fn test_delete_converges_and_tombstones() {
    let server = start_test_server().await;
    let mut alice = raw_connect(&server.url, "n1", "deviceA").await;
    let mut bob = raw_connect(&server.url, "n1", "deviceB").await;
    let _ = next_json(&mut alice).await;
    let _ = next_json(&mut bob).await;

    send_json(
        &mut alice,
        r#"{"type": "insert", "id": "op1", "position": 0, "content": "Hi",
            "vector": {"deviceA": 1}, "device_id": "deviceA"}"#,
    )
    .await;
    await_content(&mut alice, "Hi").await;
    await_content(&mut bob, "Hi").await;

    send_json(
        &mut alice,
        r#"{"type": "delete", "id": "op1", "vector": {"deviceA": 2},
            "device_id": "deviceA"}"#,
    )
    .await;
    await_content(&mut alice, "").await;
    await_content(&mut bob, "").await;

    // A later insert with the tombstoned id, from any device, is a no-op.
    send_json(
        &mut bob,
        r#"{"type": "insert", "id": "op1", "position": 0, "content": "back?",
            "vector": {"deviceB": 1}, "device_id": "deviceB"}"#,
    )
    .await;
    let ack = next_json(&mut bob).await;
    assert_eq!(ack["type"], "acknowledge");
    assert_eq!(ack["state"]["content"], "");
}

#[tokio::test]
async fn test_concurrent_inserts_order_deterministically() {
    let server = start_test_server().await;
    let mut alice = raw_connect(&server.url, "n1", "deviceA").await;
    let mut bob = raw_connect(&server.url, "n1", "deviceB").await;
    let _ = next_json(&mut alice).await;
    let _ = next_json(&mut bob).await;

    // Both insert at position 0; the id tie-break puts op2 before op3.
    send_json(
        &mut alice,
        r#"{"type": "insert", "id": "op2", "position": 0, "content": "X",
            "vector": {"deviceA": 1}, "device_id": "deviceA"}"#,
    )
    .await;
    send_json(
        &mut bob,
        r#"{"type": "insert", "id": "op3", "position": 0, "content": "Y",
            "vector": {"deviceB": 1}, "device_id": "deviceB"}"#,
    )
    .await;

    await_content(&mut alice, "XY").await;
    await_content(&mut bob, "XY").await;
}

#[tokio::test]
async fn test_eviction_persists_and_reactivation_reloads() {
    let server = start_test_server().await;
    {
        let mut alice = raw_connect(&server.url, "n1", "deviceA").await;
        let _ = next_json(&mut alice).await;
        send_json(
            &mut alice,
            r#"{"type": "insert", "id": "op1", "position": 0, "content": "Hi",
                "vector": {"deviceA": 1}, "device_id": "deviceA"}"#,
        )
        .await;
        await_content(&mut alice, "Hi").await;
        // Dropping the connection disconnects the last member.
    }

    // Eviction save is asynchronous; poll the store.
    let mut saved = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        saved = server.store.get("n1").await;
        if saved.is_some() {
            break;
        }
    }
    assert_eq!(saved.as_deref(), Some("Hi"));

    // A new connection re-activates the room from persisted content.
    let mut bob = raw_connect(&server.url, "n1", "deviceB").await;
    let json = next_json(&mut bob).await;
    assert_eq!(json["type"], "initial_state");
    assert_eq!(json["state"]["content"], "Hi");
}

#[tokio::test]
async fn test_malformed_frame_rejected_connection_survives() {
    let server = start_test_server().await;
    let mut alice = raw_connect(&server.url, "n1", "deviceA").await;
    let _ = next_json(&mut alice).await;

    send_json(&mut alice, "this is not json").await;
    let error = next_json(&mut alice).await;
    assert_eq!(error["type"], "error");

    send_json(
        &mut alice,
        r#"{"type": "edit", "id": "op1", "vector": {}, "device_id": "deviceA"}"#,
    )
    .await;
    let error = next_json(&mut alice).await;
    assert_eq!(error["type"], "error");

    // The same connection still works for valid operations.
    send_json(
        &mut alice,
        r#"{"type": "insert", "id": "op1", "position": 0, "content": "ok",
            "vector": {"deviceA": 1}, "device_id": "deviceA"}"#,
    )
    .await;
    let ack = next_json(&mut alice).await;
    assert_eq!(ack["type"], "acknowledge");
    assert_eq!(ack["state"]["content"], "ok");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = start_test_server().await;
    let mut alice = raw_connect(&server.url, "n1", "deviceA").await;
    let mut bob = raw_connect(&server.url, "n2", "deviceB").await;
    let _ = next_json(&mut alice).await;
    let _ = next_json(&mut bob).await;

    send_json(
        &mut alice,
        r#"{"type": "insert", "id": "op1", "position": 0, "content": "Hi",
            "vector": {"deviceA": 1}, "device_id": "deviceA"}"#,
    )
    .await;
    await_content(&mut alice, "Hi").await;

    // Bob, on another note, hears nothing.
    let result = timeout(Duration::from_millis(200), bob.next()).await;
    assert!(result.is_err(), "note n2 should not see n1 traffic");
}

#[tokio::test]
async fn test_reprocess_hook_fires_for_large_edits() {
    let mut server = start_test_server().await;
    let mut alice = raw_connect(&server.url, "n1", "deviceA").await;
    let _ = next_json(&mut alice).await;

    // Small edit: below the threshold, no trigger.
    send_json(
        &mut alice,
        r#"{"type": "insert", "id": "op1", "position": 0, "content": "small",
            "vector": {"deviceA": 1}, "device_id": "deviceA"}"#,
    )
    .await;
    await_content(&mut alice, "small").await;

    // Large edit: over the threshold, trigger with full content.
    let big = "x".repeat(150);
    send_json(
        &mut alice,
        &format!(
            r#"{{"type": "insert", "id": "op2", "position": 1, "content": "{big}",
                "vector": {{"deviceA": 2}}, "device_id": "deviceA"}}"#
        ),
    )
    .await;
    let expected = format!("small{big}");
    await_content(&mut alice, &expected).await;

    let (note_id, content) = timeout(Duration::from_secs(2), server.reprocess_rx.recv())
        .await
        .expect("reprocess hook should fire")
        .unwrap();
    assert_eq!(note_id, "n1");
    assert_eq!(content, expected);
}

#[tokio::test]
async fn test_sync_client_end_to_end() {
    let server = start_test_server().await;

    let mut alice = SyncClient::new(&server.url, "n1", "deviceA");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();

    assert!(matches!(
        next_event(&mut alice_events).await,
        SyncEvent::Connected
    ));
    assert!(matches!(
        next_event(&mut alice_events).await,
        SyncEvent::InitialState(_)
    ));
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    let op = alice.insert("Hi", 0).await.unwrap();
    match next_event(&mut alice_events).await {
        SyncEvent::Acknowledged {
            operation_id,
            state,
        } => {
            assert_eq!(operation_id, op.id);
            assert_eq!(state.content, "Hi");
        }
        other => panic!("expected acknowledgement, got {other:?}"),
    }

    // A second client joins and sees the current state immediately.
    let mut bob = SyncClient::new(&server.url, "n1", "deviceB");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    assert!(matches!(next_event(&mut bob_events).await, SyncEvent::Connected));
    match next_event(&mut bob_events).await {
        SyncEvent::InitialState(state) => assert_eq!(state.content, "Hi"),
        other => panic!("expected initial state, got {other:?}"),
    }
    // Content joined mid-session is reported, not just bob's own edits.
    assert_eq!(bob.content().await, "Hi");

    // Bob's edit reaches alice as a remote operation.
    let bob_op = bob.insert("!", 1).await.unwrap();
    match next_event(&mut bob_events).await {
        SyncEvent::Acknowledged { state, .. } => assert_eq!(state.content, "Hi!"),
        other => panic!("expected acknowledgement, got {other:?}"),
    }
    assert_eq!(bob.content().await, "Hi!");
    match next_event(&mut alice_events).await {
        SyncEvent::RemoteOperation { operation, state } => {
            assert_eq!(operation.id, bob_op.id);
            assert_eq!(state.content, "Hi!");
        }
        other => panic!("expected remote operation, got {other:?}"),
    }
    assert_eq!(alice.content().await, "Hi!");

    // And alice can delete her own insert; bob converges.
    alice.delete(op.id.clone()).await.unwrap();
    match next_event(&mut alice_events).await {
        SyncEvent::Acknowledged { state, .. } => assert_eq!(state.content, "!"),
        other => panic!("expected acknowledgement, got {other:?}"),
    }
    match next_event(&mut bob_events).await {
        SyncEvent::RemoteOperation { state, .. } => assert_eq!(state.content, "!"),
        other => panic!("expected remote operation, got {other:?}"),
    }
    assert_eq!(bob.content().await, "!");
}

async fn next_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}
