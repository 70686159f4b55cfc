// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for notification frame dispatch.
//!
//! These tests validate:
//! - every handler registered for a type runs, in registration order
//! - `off` removes exactly one handler
//! - malformed frames are dropped without closing the socket
//! - client messages reach the server as `{"type": ...}` envelopes
//! - pushes from the reference server update the unread count and the
//!   notification stream

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use taskflow::auth::AuthClient;
use taskflow::http::Session;
use taskflow::http::remote::{DEFAULT_TIMEOUT, ReqwestTransport};
use taskflow::realtime::{ChannelConfig, NotificationChannel};
use taskflow::resource::TaskClient;
use taskflow_proto::auth::RegisterInput;
use taskflow_proto::task::TaskInput;

// =============================================================================
// Helpers
// =============================================================================

/// Raw WebSocket server for one connection. Frames pushed into the returned
/// sender are written to the client; text frames from the client are
/// forwarded to the returned receiver.
async fn frame_server() -> (String, mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (to_client, mut outgoing) = mpsc::unbounded_channel::<String>();
    let (incoming, from_client) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                text = outgoing.recv() => {
                    let Some(text) = text else { break };
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = incoming.send(text.to_string());
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    });

    (url, to_client, from_client)
}

fn channel(url: &str) -> NotificationChannel {
    NotificationChannel::new(ChannelConfig::new(url))
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

async fn next_client_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for client frame")
        .unwrap();
    serde_json::from_str(&text).unwrap()
}

// =============================================================================
// Handler fan-out
// =============================================================================

#[tokio::test]
async fn handlers_run_in_registration_order() {
    let (url, server, _from_client) = frame_server().await;
    let channel = channel(&url);
    let order = Arc::new(Mutex::new(Vec::new()));
    for label in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        channel.on("unread_count", move |frame| {
            order
                .lock()
                .push((label, frame["count"].as_u64().unwrap_or_default()));
        });
    }
    let other = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&other);
    channel.on("pong", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    channel.connect("1", "t").await.unwrap();
    server
        .send(r#"{"type":"unread_count","count":7}"#.into())
        .unwrap();

    wait_until(|| order.lock().len() == 3).await;
    assert_eq!(
        *order.lock(),
        vec![("first", 7), ("second", 7), ("third", 7)]
    );
    assert_eq!(other.load(Ordering::SeqCst), 0);
    assert_eq!(channel.unread_count(), 7);
}

#[tokio::test]
async fn off_removes_only_that_handler() {
    let (url, server, _from_client) = frame_server().await;
    let channel = channel(&url);
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for label in ["a", "b", "c"] {
        let order = Arc::clone(&order);
        ids.push(channel.on("custom_event", move |_| order.lock().push(label)));
    }
    assert!(channel.off("custom_event", ids[1]));
    assert!(!channel.off("custom_event", ids[1]));
    assert!(!channel.off("other_event", ids[0]));

    channel.connect("1", "t").await.unwrap();
    server.send(r#"{"type":"custom_event"}"#.into()).unwrap();

    wait_until(|| order.lock().len() == 2).await;
    assert_eq!(*order.lock(), vec!["a", "c"]);
}

#[tokio::test]
async fn auth_success_subscribes_automatically() {
    let (url, server, mut from_client) = frame_server().await;
    let channel = channel(&url);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    channel.on("auth_success", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    channel.connect("1", "t").await.unwrap();
    server
        .send(r#"{"type":"auth_success","user_id":"1"}"#.into())
        .unwrap();

    let frame = next_client_frame(&mut from_client).await;
    assert_eq!(frame["type"], "subscribe_to_notifications");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Malformed frames
// =============================================================================

#[tokio::test]
async fn malformed_frames_do_not_close_the_socket() {
    let (url, server, mut from_client) = frame_server().await;
    let channel = channel(&url);
    let pongs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pongs);
    channel.on("pong", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    channel.connect("1", "t").await.unwrap();

    for junk in ["not json", "{", "[]", "42", r#"{"type":null}"#, r#"{"kind":"pong"}"#] {
        server.send(junk.into()).unwrap();
    }
    server.send(r#"{"type":"pong","timestamp":1}"#.into()).unwrap();

    wait_until(|| pongs.load(Ordering::SeqCst) == 1).await;
    assert!(channel.is_connected());
    assert!(channel.last_pong().is_some());

    channel.ping().unwrap();
    let frame = next_client_frame(&mut from_client).await;
    assert_eq!(frame, serde_json::json!({"type": "ping"}));
}

#[tokio::test]
async fn unknown_and_error_frames_are_tolerated() {
    let (url, server, mut from_client) = frame_server().await;
    let channel = channel(&url);
    channel.connect("1", "t").await.unwrap();

    server.send(r#"{"type":"server_shutdown_soon"}"#.into()).unwrap();
    server
        .send(r#"{"type":"error","message":"boom"}"#.into())
        .unwrap();
    server
        .send(r#"{"type":"new_notification","notification":"not an object"}"#.into())
        .unwrap();

    channel.get_unread_count().unwrap();
    let frame = next_client_frame(&mut from_client).await;
    assert_eq!(frame["type"], "get_unread_count");
    assert!(channel.is_connected());
    assert_eq!(channel.unread_count(), 0);
}

// =============================================================================
// Against the reference server
// =============================================================================

#[tokio::test]
async fn task_changes_push_notifications() {
    let (addr, _state, _handle) = taskflow_server::api::start_server("127.0.0.1:0")
        .await
        .unwrap();
    let session = Session::default();
    let transport =
        ReqwestTransport::new(format!("http://{addr}"), DEFAULT_TIMEOUT, session.clone()).unwrap();
    let auth = AuthClient::new(transport.clone(), session.clone());
    let user = auth
        .register(&RegisterInput {
            username: "carol".into(),
            email: "carol@example.com".into(),
            password: "pw".into(),
            full_name: None,
        })
        .await
        .unwrap();
    let token = auth.login("carol", "pw").await.unwrap();

    let channel = channel(&format!("ws://{addr}"));
    let mut notifications = channel.notifications();
    let authed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&authed);
    channel.on("auth_success", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    channel
        .connect(&user.id, &token.access_token)
        .await
        .unwrap();

    // The subscribe frame is queued before the ping, so the pong proves
    // the server has processed it.
    wait_until(|| authed.load(Ordering::SeqCst) == 1).await;
    channel.ping().unwrap();
    wait_until(|| channel.last_pong().is_some()).await;
    let unread_before = channel.unread_count();

    let tasks = TaskClient::new(transport);
    let created = tasks.create(&TaskInput::new("Buy milk")).await.unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.task_id.as_deref(), Some(created.id.as_str()));
    assert_eq!(channel.unread_count(), unread_before + 1);

    channel.get_unread_count().unwrap();
    wait_until(|| channel.unread_count() == unread_before + 1).await;
    channel.disconnect();
}
