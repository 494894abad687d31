//! End-to-end tests using a real WebSocket client.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use evcast_server::{start, ServerConfig, ServerHandle};
use evcast_store::{EventStore, JsonFileStorage, MemoryStorage, Storage};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot_with(storage: Arc<dyn Storage>) -> ServerHandle {
    let store = Arc::new(EventStore::open(storage).unwrap());
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    start(config, store).await.unwrap()
}

async fn boot() -> ServerHandle {
    boot_with(Arc::new(MemoryStorage::new())).await
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{}/ws", handle.addr)).await.unwrap();
    ws
}

/// Next JSON text frame, skipping control frames.
async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Connect and consume the initial snapshot.
async fn connect_ready(handle: &ServerHandle) -> (WsStream, Value) {
    let mut ws = connect(handle).await;
    let initial = recv_json(&mut ws).await;
    assert_eq!(initial["type"], "update");
    (ws, initial)
}

fn events(message: &Value) -> &Vec<Value> {
    assert_eq!(message["type"], "update", "expected update, got {message}");
    message["events"].as_array().unwrap()
}

#[tokio::test]
async fn add_then_delete_reaches_every_client() {
    let handle = boot().await;
    let (mut a, initial_a) = connect_ready(&handle).await;
    let (mut b, initial_b) = connect_ready(&handle).await;
    assert!(events(&initial_a).is_empty());
    assert!(events(&initial_b).is_empty());

    send_json(
        &mut a,
        json!({"action": "addEvent", "payload": {"title": "Standup", "start": "2024-05-01T09:00"}}),
    )
    .await;

    let mut ids = Vec::new();
    for ws in [&mut a, &mut b] {
        let update = recv_json(ws).await;
        let list = events(&update);
        assert_eq!(list.len(), 1);
        assert!(list[0]["id"].as_str().unwrap().starts_with("evt_"));
        assert_eq!(list[0]["title"], "Standup");
        assert_eq!(list[0]["start"], "2024-05-01T09:00");
        ids.push(list[0]["id"].clone());
    }
    assert_eq!(ids[0], ids[1]);

    send_json(&mut b, json!({"action": "deleteEvent", "payload": {"id": ids[0]}})).await;
    for ws in [&mut a, &mut b] {
        assert!(events(&recv_json(ws).await).is_empty());
    }

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn late_joiner_gets_current_state() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;
    send_json(&mut a, json!({"action": "addEvent", "payload": {"title": "Retro"}})).await;
    let _ = recv_json(&mut a).await;

    let (_late, initial) = connect_ready(&handle).await;
    let list = events(&initial);
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["title"], "Retro");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn update_replaces_event_for_everyone() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;
    let (mut b, _) = connect_ready(&handle).await;

    send_json(&mut a, json!({"action": "addEvent", "payload": {"title": "Draft", "room": "4B"}})).await;
    let _ = recv_json(&mut a).await;
    let added = recv_json(&mut b).await;
    let id = events(&added)[0]["id"].clone();

    send_json(
        &mut b,
        json!({"action": "updateEvent", "payload": {"id": id, "title": "Final"}}),
    )
    .await;
    for ws in [&mut a, &mut b] {
        let update = recv_json(ws).await;
        let list = events(&update);
        assert_eq!(list[0]["title"], "Final");
        assert!(list[0].get("room").is_none());
    }

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn malformed_message_gets_error_and_connection_survives() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;
    let (mut b, _) = connect_ready(&handle).await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    let reply = recv_json(&mut a).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "DECODE_ERROR");

    // Same socket keeps working, and only the sender heard about the error.
    send_json(&mut a, json!({"action": "addEvent", "payload": {"title": "ok"}})).await;
    assert_eq!(events(&recv_json(&mut a).await).len(), 1);
    assert_eq!(events(&recv_json(&mut b).await).len(), 1);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;

    send_json(&mut a, json!({"action": "renameEvent", "payload": {"id": "evt_1"}})).await;
    let reply = recv_json(&mut a).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "INVALID_ACTION");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn update_of_missing_event_is_not_found() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;

    send_json(
        &mut a,
        json!({"action": "updateEvent", "payload": {"id": "evt_42", "title": "ghost"}}),
    )
    .await;
    let reply = recv_json(&mut a).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "NOT_FOUND");

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn concurrent_adds_get_unique_ids() {
    let handle = boot().await;
    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(connect_ready(&handle).await.0);
    }

    let per_client = 5;
    for (i, ws) in clients.iter_mut().enumerate() {
        for j in 0..per_client {
            send_json(ws, json!({"action": "addEvent", "payload": {"title": format!("{i}-{j}")}})).await;
        }
    }

    // Every client sees every commit; the last snapshot holds all of them.
    let total = clients.len() * per_client;
    let mut last = Value::Null;
    for _ in 0..total {
        last = recv_json(&mut clients[0]).await;
    }
    let list = events(&last);
    assert_eq!(list.len(), total);
    let ids: HashSet<_> = list.iter().map(|e| e["id"].as_str().unwrap().to_string()).collect();
    assert_eq!(ids.len(), total);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn snapshots_arrive_in_commit_order() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;
    let (mut b, _) = connect_ready(&handle).await;

    for i in 0..10 {
        send_json(&mut a, json!({"action": "addEvent", "payload": {"n": i}})).await;
    }
    for expected in 1..=10 {
        assert_eq!(events(&recv_json(&mut b).await).len(), expected);
    }

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn changes_persist_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.json");

    let handle = boot_with(Arc::new(JsonFileStorage::new(&path))).await;
    let (mut a, _) = connect_ready(&handle).await;
    send_json(&mut a, json!({"action": "addEvent", "payload": {"title": "Keep me"}})).await;
    let added = recv_json(&mut a).await;
    let kept_id = events(&added)[0]["id"].clone();
    drop(a);
    handle.shutdown(Duration::from_secs(2)).await;

    assert_on_disk(&path, "Keep me");

    let handle = boot_with(Arc::new(JsonFileStorage::new(&path))).await;
    let (mut b, initial) = connect_ready(&handle).await;
    let list = events(&initial);
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], kept_id);

    send_json(&mut b, json!({"action": "addEvent", "payload": {"title": "Second"}})).await;
    let update = recv_json(&mut b).await;
    let list = events(&update);
    assert_eq!(list[0]["id"], kept_id);
    assert_ne!(list[1]["id"], kept_id);

    handle.shutdown(Duration::from_secs(2)).await;
}

fn assert_on_disk(path: &Path, title: &str) {
    let raw = std::fs::read_to_string(path).unwrap();
    let stored: Vec<Value> = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["title"], title);
}

#[tokio::test]
async fn health_tracks_connections_and_events() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;
    send_json(&mut a, json!({"action": "addEvent", "payload": {"title": "x"}})).await;
    let _ = recv_json(&mut a).await;

    let body: Value = reqwest::get(format!("http://{}/health", handle.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["events"], 1);
    assert_eq!(body["commits"], 1);
    assert_eq!(body["broadcasts"], 1);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn closed_client_is_deregistered() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;
    assert_eq!(handle.connections(), 1);

    a.close(None).await.unwrap();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while handle.connections() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "client never deregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let handle = boot().await;
    let (mut a, _) = connect_ready(&handle).await;

    handle.shutdown(Duration::from_secs(2)).await;

    let ended = timeout(TIMEOUT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
