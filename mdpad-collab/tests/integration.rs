//! End-to-end tests: a real server on a free port and real WebSocket
//! sessions editing the same document.

use std::sync::Arc;
use std::time::Duration;

use mdpad_collab::buffer::TextBuffer;
use mdpad_collab::protocol::{ClientMessage, ServerMessage};
use mdpad_collab::server::{ServerConfig, SyncServer};
use mdpad_collab::session::{DocumentSession, SessionCallbacks, SessionConfig};
use mdpad_collab::share::{generate_document_id, socket_uri};
use mdpad_collab::transport::WebSocketConnector;
use mdpad_core::{SyncStatus, UserProfile};
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

/// Start a server on a free port, return it and its origin.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        broadcast_capacity: 64,
        sweep_interval: Duration::from_secs(60),
    }));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("http://{addr}"))
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        reconnect_jitter: 0.0,
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

fn open(uri: &str, callbacks: SessionCallbacks) -> DocumentSession<TextBuffer> {
    let session = DocumentSession::with_options(
        uri,
        TextBuffer::new(""),
        callbacks,
        fast_config(),
        Arc::new(WebSocketConnector),
    );
    session.connect();
    session
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let result = timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn synced(session: &DocumentSession<TextBuffer>) {
    eventually("session to synchronize", || {
        session.is_online() && session.status() == SyncStatus::Synchronized
    })
    .await;
}

#[tokio::test]
async fn test_raw_client_gets_identity_then_snapshot() {
    use futures_util::StreamExt;

    let (_server, origin) = start_test_server().await;
    let uri = socket_uri(&origin, "raw").unwrap();
    let (mut ws, _) = tokio_tungstenite::connect_async(&uri).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        received.push(ServerMessage::decode(frame.to_text().unwrap()).unwrap());
    }
    assert!(matches!(received[0], ServerMessage::Identity { .. }));
    assert!(matches!(
        received[1],
        ServerMessage::Snapshot { revision: 0, .. }
    ));
}

#[tokio::test]
async fn test_unknown_path_is_refused() {
    let (_server, origin) = start_test_server().await;
    let uri = format!("{}/elsewhere", origin.replace("http", "ws"));
    assert!(tokio_tungstenite::connect_async(&uri).await.is_err());
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let (server, origin) = start_test_server().await;
    let document = generate_document_id(3600);
    let uri = socket_uri(&origin, &document).unwrap();

    let a = open(&uri, SessionCallbacks::new());
    let b = open(&uri, SessionCallbacks::new());
    synced(&a).await;
    synced(&b).await;

    a.edit(|buffer| buffer.append("abc")).unwrap();
    eventually("b to see abc", || b.text() == "abc").await;
    assert_eq!(b.revision(), 1);

    // Concurrent edits at both ends of the text.
    a.edit(|buffer| buffer.insert(0, "X")).unwrap();
    b.edit(|buffer| buffer.insert(3, "Y")).unwrap();

    eventually("both to converge", || {
        a.text() == "XabcY" && b.text() == "XabcY" && a.revision() == 3 && b.revision() == 3
    })
    .await;
    synced(&a).await;
    synced(&b).await;
    assert_eq!(server.document_text(&document).await.as_deref(), Some("XabcY"));
    assert_eq!(server.document_revision(&document).await, Some(3));
}

#[tokio::test]
async fn test_burst_of_edits_converges() {
    let (server, origin) = start_test_server().await;
    let uri = socket_uri(&origin, "burst").unwrap();

    let a = open(&uri, SessionCallbacks::new());
    let b = open(&uri, SessionCallbacks::new());
    synced(&a).await;
    synced(&b).await;

    for i in 0..20 {
        a.edit(|buffer| buffer.append(&format!("a{i} "))).unwrap();
        b.edit(|buffer| buffer.insert(0, "b")).unwrap();
    }

    eventually("sessions to drain", || {
        a.status() == SyncStatus::Synchronized
            && b.status() == SyncStatus::Synchronized
            && a.text() == b.text()
            && a.revision() == b.revision()
    })
    .await;
    let text = a.text();
    assert_eq!(text.matches('b').count(), 20);
    assert!(text.ends_with("a19 "));
    assert_eq!(server.document_text("burst").await, Some(text));
}

#[tokio::test]
async fn test_late_joiner_gets_current_text() {
    let (_server, origin) = start_test_server().await;
    let uri = socket_uri(&origin, "late").unwrap();

    let a = open(&uri, SessionCallbacks::new());
    synced(&a).await;
    a.edit(|buffer| buffer.append("hello")).unwrap();
    eventually("ack", || a.revision() == 1).await;

    let b = open(&uri, SessionCallbacks::new());
    eventually("snapshot", || b.text() == "hello").await;
    assert_eq!(b.revision(), 1);
}

#[tokio::test]
async fn test_presence_join_and_leave() {
    let (_server, origin) = start_test_server().await;
    let uri = socket_uri(&origin, "presence").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let a = open(
        &uri,
        SessionCallbacks::new().on_change_users(move |users| sink.lock().push(users.len())),
    );
    synced(&a).await;

    let b = open(&uri, SessionCallbacks::new());
    b.set_info(UserProfile::new("Grace", 200));
    synced(&b).await;

    eventually("a to see Grace", || {
        a.users().values().any(|user| user.name == "Grace")
    })
    .await;
    assert!(a.users().len() == 1, "own identity must not be listed");
    assert!(b.user_id().is_some());
    assert_ne!(a.user_id(), b.user_id());

    b.dispose();
    eventually("a to see Grace leave", || a.users().is_empty()).await;
    assert_eq!(seen.lock().last(), Some(&0));
}

#[tokio::test]
async fn test_language_is_broadcast() {
    let (_server, origin) = start_test_server().await;
    let uri = socket_uri(&origin, "language").unwrap();

    let languages = Arc::new(Mutex::new(Vec::new()));
    let sink = languages.clone();
    let a = open(&uri, SessionCallbacks::new());
    let b = open(
        &uri,
        SessionCallbacks::new().on_change_language(move |language| sink.lock().push(language)),
    );
    synced(&a).await;
    synced(&b).await;

    assert!(a.set_language("rust"));
    assert!(!a.set_language("rust"));
    eventually("b to switch language", || {
        b.language().as_deref() == Some("rust")
    })
    .await;
    assert_eq!(languages.lock().as_slice(), ["rust".to_string()]);

    let c = open(&uri, SessionCallbacks::new());
    eventually("late joiner language", || {
        c.language().as_deref() == Some("rust")
    })
    .await;
}

#[tokio::test]
async fn test_remote_selection_is_relayed() {
    let (_server, origin) = start_test_server().await;
    let uri = socket_uri(&origin, "selection").unwrap();

    let a = open(&uri, SessionCallbacks::new());
    let b = open(&uri, SessionCallbacks::new());
    synced(&a).await;
    synced(&b).await;
    a.edit(|buffer| buffer.append("hello world")).unwrap();
    eventually("b to catch up", || b.text() == "hello world").await;

    b.set_selection(vec![mdpad_core::SelectionRange::new(6, 11)]);
    let b_id = b.user_id().unwrap();
    eventually("a to see b's selection", || {
        a.selections().contains_key(&b_id)
    })
    .await;

    // An edit before the selection shifts it.
    a.edit(|buffer| buffer.insert(0, ">> ")).unwrap();
    eventually("selection to move", || {
        a.selections()[&b_id] == vec![mdpad_core::SelectionRange::new(9, 14)]
    })
    .await;
}

#[tokio::test]
async fn test_malformed_client_message_closes_connection() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (_server, origin) = start_test_server().await;
    let uri = socket_uri(&origin, "bad").unwrap();
    let (mut ws, _) = tokio_tungstenite::connect_async(&uri).await.unwrap();

    let op = mdpad_core::Operation::new().retain(9);
    let text = ClientMessage::Operation { revision: 0, ops: op }
        .encode()
        .unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
