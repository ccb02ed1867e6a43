//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real hub on an ephemeral port and connect real
//! participants, verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scrivener_collab::client::{ParticipantClient, ParticipantEvent};
use scrivener_collab::config::HubConfig;
use scrivener_collab::protocol::{ClientMessage, DocumentId, ServerMessage};
use scrivener_collab::server::SyncHub;
use scrivener_collab::storage::MemoryStore;
use scrivener_delta::{Content, Delta};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a hub over `store` on a free port, return it with its URL.
async fn start_hub_with(config: HubConfig, store: Arc<MemoryStore>) -> (Arc<SyncHub>, String) {
    let hub = Arc::new(SyncHub::with_store(config, store));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn({
        let hub = hub.clone();
        async move { hub.serve(listener).await.unwrap() }
    });
    (hub, url)
}

async fn start_hub() -> (Arc<SyncHub>, Arc<MemoryStore>, String) {
    let store = Arc::new(MemoryStore::new());
    let (hub, url) = start_hub_with(HubConfig::in_memory(), store.clone()).await;
    (hub, store, url)
}

fn doc(name: &str) -> DocumentId {
    DocumentId::new(name).unwrap()
}

async fn raw(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    send_text(ws, &message.encode().unwrap()).await;
}

async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::text(text.to_string())).await.unwrap();
}

/// Next server message, skipping control frames.
async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

/// Assert nothing but control frames arrive for `wait`.
async fn expect_silence(ws: &mut Ws, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {text}"),
            Ok(Some(Ok(_))) => {}
            Ok(other) => panic!("connection ended: {other:?}"),
        }
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ParticipantEvent>) -> ParticipantEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn participant(
    url: &str,
    name: &str,
) -> (ParticipantClient, mpsc::Receiver<ParticipantEvent>) {
    let mut client = ParticipantClient::connect(url, doc(name), Duration::from_millis(2000))
        .await
        .unwrap();
    let mut events = client.take_event_rx().unwrap();
    assert!(matches!(next_event(&mut events).await, ParticipantEvent::Loaded(_)));
    (client, events)
}

#[tokio::test]
async fn test_hub_accepts_connections() {
    let (hub, _store, url) = start_hub().await;
    let _ws = raw(&url).await;

    for _ in 0..50 {
        if hub.stats().await.active_connections == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = hub.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
}

#[tokio::test]
async fn test_two_participants_scenario() {
    let (_hub, store, url) = start_hub().await;

    let mut alice = ParticipantClient::connect(&url, doc("doc1"), Duration::from_millis(2000))
        .await
        .unwrap();
    let mut alice_events = alice.take_event_rx().unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        ParticipantEvent::Loaded(Content::new())
    );

    let (bob, mut bob_events) = participant(&url, "doc1").await;

    alice.edit(Delta::new().insert("hi")).await.unwrap();
    assert_eq!(
        next_event(&mut bob_events).await,
        ParticipantEvent::RemoteChanges(Delta::new().insert("hi"))
    );
    assert_eq!(bob.contents().await.unwrap().text(), "hi");

    // Nothing is written before the debounce elapses.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(store.writes_for(&doc("doc1")).is_empty());

    let mut saved = None;
    for _ in 0..40 {
        if let Some(record) = store.writes_for(&doc("doc1")).pop() {
            saved = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(saved.expect("snapshot never written").content.text(), "hi");
}

#[tokio::test]
async fn test_no_echo_to_origin() {
    let (_hub, _store, url) = start_hub().await;
    let mut alice = raw(&url).await;
    let mut bob = raw(&url).await;

    for ws in [&mut alice, &mut bob] {
        send(ws, &ClientMessage::GetDocument(doc("doc1"))).await;
        assert!(matches!(recv(ws).await, ServerMessage::LoadDocument(_)));
    }

    let delta = Delta::new().insert("x");
    send(&mut alice, &ClientMessage::SendChanges(delta.clone())).await;
    assert_eq!(recv(&mut bob).await, ServerMessage::ReceiveChanges(delta));
    expect_silence(&mut alice, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_client_does_not_echo_remote_changes() {
    let (_hub, _store, url) = start_hub().await;
    let mut alice = raw(&url).await;
    send(&mut alice, &ClientMessage::GetDocument(doc("doc1"))).await;
    recv(&mut alice).await;
    let (bob, mut bob_events) = participant(&url, "doc1").await;

    let delta = Delta::new().insert("from alice");
    send(&mut alice, &ClientMessage::SendChanges(delta.clone())).await;
    assert_eq!(
        next_event(&mut bob_events).await,
        ParticipantEvent::RemoteChanges(delta)
    );
    assert_eq!(bob.contents().await.unwrap().text(), "from alice");
    expect_silence(&mut alice, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_load_is_idempotent() {
    let store = Arc::new(
        MemoryStore::new().with_document(doc("seeded"), Content::from_text("existing text")),
    );
    let (_hub, url) = start_hub_with(HubConfig::in_memory(), store).await;

    let mut loads = Vec::new();
    for _ in 0..2 {
        let mut ws = raw(&url).await;
        send(&mut ws, &ClientMessage::GetDocument(doc("seeded"))).await;
        loads.push(recv(&mut ws).await);
    }
    assert_eq!(loads[0], loads[1]);
    assert_eq!(
        loads[0],
        ServerMessage::LoadDocument(Content::from_text("existing text"))
    );
}

#[tokio::test]
async fn test_replicas_converge() {
    let (hub, _store, url) = start_hub().await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(participant(&url, "shared").await);
    }

    let edits = [
        (0, Delta::new().insert("Hello")),
        (1, Delta::new().retain(5).insert(" world")),
        (2, Delta::new().retain(5).delete(6).insert(", there")),
        (0, Delta::new().retain(12).insert("!")),
    ];
    for (author, delta) in edits {
        clients[author].0.edit(delta.clone()).await.unwrap();
        for (index, (_, events)) in clients.iter_mut().enumerate() {
            if index != author {
                assert_eq!(
                    next_event(events).await,
                    ParticipantEvent::RemoteChanges(delta.clone())
                );
            }
        }
    }

    let session = hub.registry().get(&doc("shared")).await.unwrap();
    let authoritative = session.snapshot().await.unwrap().content;
    assert_eq!(authoritative.text(), "Hello, there!");
    for (client, _) in &clients {
        assert_eq!(client.contents().await.unwrap(), authoritative);
    }
}

#[tokio::test]
async fn test_concurrent_joins_share_one_session() {
    let (hub, _store, url) = start_hub().await;

    let mut joins = Vec::new();
    for _ in 0..10 {
        let url = url.clone();
        joins.push(tokio::spawn(async move {
            let mut ws = raw(&url).await;
            send(&mut ws, &ClientMessage::GetDocument(doc("busy"))).await;
            let load = recv(&mut ws).await;
            (ws, load)
        }));
    }
    let mut sockets = Vec::new();
    for join in joins {
        let (ws, load) = join.await.unwrap();
        assert_eq!(load, ServerMessage::LoadDocument(Content::new()));
        sockets.push(ws);
    }

    assert_eq!(hub.stats().await.active_sessions, 1);
    let session = hub.registry().get(&doc("busy")).await.unwrap();
    assert_eq!(session.snapshot().await.unwrap().participants, 10);
}

#[tokio::test]
async fn test_invalid_delta_resyncs_origin() {
    let store =
        Arc::new(MemoryStore::new().with_document(doc("doc1"), Content::from_text("abc")));
    let (_hub, url) = start_hub_with(HubConfig::in_memory(), store).await;
    let mut alice = raw(&url).await;
    let mut bob = raw(&url).await;
    for ws in [&mut alice, &mut bob] {
        send(ws, &ClientMessage::GetDocument(doc("doc1"))).await;
        recv(ws).await;
    }

    // Out of range.
    send(
        &mut alice,
        &ClientMessage::SendChanges(Delta::new().retain(10).delete(1)),
    )
    .await;
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::ResyncDocument(Content::from_text("abc"))
    );

    // Not a delta at all.
    send_text(&mut alice, r#"{"event":"send-changes","payload":"nonsense"}"#).await;
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::ResyncDocument(Content::from_text("abc"))
    );

    // Malformed op.
    send_text(
        &mut alice,
        r#"{"event":"send-changes","payload":{"ops":[{"retain":0}]}}"#,
    )
    .await;
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::ResyncDocument(_)
    ));

    expect_silence(&mut bob, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_op_with_two_kinds_is_rejected_and_resynced() {
    let store =
        Arc::new(MemoryStore::new().with_document(doc("doc1"), Content::from_text("abc")));
    let (hub, url) = start_hub_with(HubConfig::in_memory(), store).await;
    let mut alice = raw(&url).await;
    let mut bob = raw(&url).await;
    for ws in [&mut alice, &mut bob] {
        send(ws, &ClientMessage::GetDocument(doc("doc1"))).await;
        recv(ws).await;
    }

    for payload in [
        r#"{"ops":[{"insert":"x","delete":1}]}"#,
        r#"{"ops":[{"retain":1,"delete":2}]}"#,
    ] {
        send_text(
            &mut alice,
            &format!(r#"{{"event":"send-changes","payload":{payload}}}"#),
        )
        .await;
        assert_eq!(
            recv(&mut alice).await,
            ServerMessage::ResyncDocument(Content::from_text("abc"))
        );
    }

    expect_silence(&mut bob, Duration::from_millis(300)).await;
    let session = hub.registry().get(&doc("doc1")).await.unwrap();
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.content.text(), "abc");
    assert_eq!(snapshot.version, 0);
}

#[tokio::test]
async fn test_zero_timeouts_are_clamped() {
    let config = HubConfig {
        idle_grace: Duration::ZERO,
        heartbeat_interval: Duration::ZERO,
        ..HubConfig::in_memory()
    };
    let (_hub, url) = start_hub_with(config, Arc::new(MemoryStore::new())).await;

    let (alice, _alice_events) = participant(&url, "doc1").await;
    let (_bob, mut bob_events) = participant(&url, "doc1").await;
    alice.edit(Delta::new().insert("still here")).await.unwrap();
    assert!(matches!(
        next_event(&mut bob_events).await,
        ParticipantEvent::RemoteChanges(_)
    ));
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let (_hub, _store, url) = start_hub().await;
    let mut ws = raw(&url).await;

    send_text(&mut ws, "not json").await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send_text(&mut ws, r#"{"event":"fetch-document","payload":"doc1"}"#).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send(&mut ws, &ClientMessage::SendChanges(Delta::new().insert("x"))).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send(&mut ws, &ClientMessage::SaveDocument(Content::new())).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send_text(&mut ws, r#"{"event":"get-document","payload":""}"#).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send(&mut ws, &ClientMessage::GetDocument(doc("doc1"))).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::LoadDocument(Content::new())
    );
}

#[tokio::test]
async fn test_switching_documents() {
    let (hub, _store, url) = start_hub().await;
    let mut alice = raw(&url).await;
    let mut bob = raw(&url).await;

    send(&mut bob, &ClientMessage::GetDocument(doc("doc1"))).await;
    recv(&mut bob).await;
    send(&mut alice, &ClientMessage::GetDocument(doc("doc1"))).await;
    recv(&mut alice).await;
    send(&mut alice, &ClientMessage::GetDocument(doc("doc2"))).await;
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::LoadDocument(Content::new())
    );

    send(&mut bob, &ClientMessage::SendChanges(Delta::new().insert("only doc1"))).await;
    expect_silence(&mut alice, Duration::from_millis(300)).await;

    let doc1 = hub.registry().get(&doc("doc1")).await.unwrap();
    let snapshot = doc1.snapshot().await.unwrap();
    assert_eq!(snapshot.participants, 1);
    assert_eq!(snapshot.content.text(), "only doc1");
}

#[tokio::test]
async fn test_disconnect_detaches() {
    let (hub, _store, url) = start_hub().await;
    let (alice, _alice_events) = participant(&url, "doc1").await;
    let (bob, _bob_events) = participant(&url, "doc1").await;

    bob.disconnect().await;
    let session = hub.registry().get(&doc("doc1")).await.unwrap();
    for _ in 0..50 {
        if session.snapshot().await.unwrap().participants == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(session.snapshot().await.unwrap().participants, 1);

    alice.edit(Delta::new().insert("still here")).await.unwrap();
    assert!(alice.is_connected());
}

#[tokio::test]
async fn test_silent_connection_is_dropped() {
    let config = HubConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..HubConfig::in_memory()
    };
    let (hub, url) = start_hub_with(config, Arc::new(MemoryStore::new())).await;
    let mut ws = raw(&url).await;

    // Not reading means our pongs never go out.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);

    for _ in 0..50 {
        if hub.stats().await.active_connections == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.stats().await.active_connections, 0);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_edits() {
    let store = Arc::new(MemoryStore::new());
    let config = HubConfig {
        save_debounce: Duration::from_secs(600),
        ..HubConfig::in_memory()
    };
    let (hub, url) = start_hub_with(config, store.clone()).await;
    let (alice, _events) = participant(&url, "doc1").await;

    alice.edit(Delta::new().insert("unsaved")).await.unwrap();
    let session = hub.registry().get(&doc("doc1")).await.unwrap();
    for _ in 0..50 {
        if session.snapshot().await.unwrap().dirty {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    hub.shutdown().await.unwrap();
    let writes = store.writes_for(&doc("doc1"));
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].content.text(), "unsaved");
}
