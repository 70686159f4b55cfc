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

//! Integration tests for notification channel reconnects.
//!
//! These tests validate:
//! - an abnormal close starts reconnecting and a successful attempt returns
//!   the channel to `Connected`
//! - after `max_attempts` failed attempts the channel is `Exhausted` and
//!   makes no further attempts
//! - a manual `disconnect()` sends a normal close and never reconnects
//! - a normal close from the server does not trigger reconnects
//! - `retry()` recovers an exhausted channel
//! - replacing a connection never strands the live socket's send queue
//!
//! ## Scripted server
//!
//! Misbehaving-server cases use a raw `tokio-tungstenite` listener whose
//! per-connection behaviour is a closure of the accept index. Dropping the
//! TCP stream before the handshake makes that connection attempt fail.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use taskflow::realtime::{
    Backoff, ChannelConfig, ConnectionState, NotificationChannel, ReconnectPolicy,
};
use taskflow_proto::auth::RegisterInput;

// =============================================================================
// Helpers
// =============================================================================

/// A raw WebSocket listener that hands every accepted TCP stream, with its
/// accept index, to a script.
struct ScriptedServer {
    url: String,
    accepts: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl ScriptedServer {
    async fn start<F, Fut>(script: F) -> Self
    where
        F: Fn(usize, TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(script(index, stream));
            }
        });
        Self {
            url: format!("ws://{addr}"),
            accepts,
            handle,
        }
    }

    fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Completes the handshake and closes with `code`.
async fn accept_then_close(stream: TcpStream, code: CloseCode) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let _ = ws
        .close(Some(CloseFrame {
            code,
            reason: "scripted".into(),
        }))
        .await;
    while ws.next().await.is_some() {}
}

/// Completes the handshake and holds the socket open until the client
/// closes it. Records the client's close code.
async fn accept_and_hold(stream: TcpStream, close_code: Arc<Mutex<Option<u16>>>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Close(frame) = msg {
            *close_code.lock() = frame.map(|f| u16::from(f.code));
            break;
        }
    }
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_attempts,
        backoff: Backoff::Linear,
    }
}

fn channel_for(url: &str, max_attempts: u32) -> NotificationChannel {
    NotificationChannel::new(ChannelConfig {
        ws_url: Some(url.to_string()),
        connect_timeout: Duration::from_secs(2),
        reconnect: fast_policy(max_attempts),
    })
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    *tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for connection state")
        .unwrap()
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

// =============================================================================
// Reconnect cap
// =============================================================================

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let server = ScriptedServer::start(|index, stream| async move {
        if index == 0 {
            accept_then_close(stream, CloseCode::Error).await;
        }
        // Later connections are dropped before the handshake.
    })
    .await;

    let channel = channel_for(&server.url, 3);
    let mut states = channel.watch_state();
    channel.connect("1", "token").await.unwrap();

    let state = wait_for_state(&mut states, |s| *s == ConnectionState::Exhausted).await;
    assert_eq!(state, ConnectionState::Exhausted);
    assert_eq!(server.accepts(), 4);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.accepts(), 4, "no attempts after giving up");
    assert_eq!(channel.state(), ConnectionState::Exhausted);
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn reconnecting_states_count_attempts() {
    let server = ScriptedServer::start(|index, stream| async move {
        if index == 0 {
            accept_then_close(stream, CloseCode::Away).await;
        }
    })
    .await;

    let channel = channel_for(&server.url, 2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut states = channel.watch_state();
    let recorder = Arc::clone(&seen);
    let mut observer = channel.watch_state();
    tokio::spawn(async move {
        while observer.changed().await.is_ok() {
            let state = *observer.borrow_and_update();
            recorder.lock().push(state);
        }
    });

    channel.connect("1", "token").await.unwrap();
    wait_for_state(&mut states, |s| *s == ConnectionState::Exhausted).await;

    let seen = seen.lock().clone();
    assert!(seen.contains(&ConnectionState::Reconnecting { attempt: 1 }));
    assert!(seen.contains(&ConnectionState::Reconnecting { attempt: 2 }));
    assert!(!seen.contains(&ConnectionState::Reconnecting { attempt: 3 }));
}

#[tokio::test]
async fn retry_recovers_exhausted_channel() {
    let server = ScriptedServer::start(|index, stream| async move {
        match index {
            0 => accept_then_close(stream, CloseCode::Error).await,
            1 => {}
            _ => accept_and_hold(stream, Arc::new(Mutex::new(None))).await,
        }
    })
    .await;

    let channel = channel_for(&server.url, 1);
    let mut states = channel.watch_state();
    channel.connect("1", "token").await.unwrap();
    wait_for_state(&mut states, |s| *s == ConnectionState::Exhausted).await;

    channel.retry().await.unwrap();
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert!(channel.is_connected());
    assert_eq!(server.accepts(), 3);
}

#[tokio::test]
async fn reconnects_after_abnormal_close() {
    let server = ScriptedServer::start(|index, stream| async move {
        if index == 0 {
            accept_then_close(stream, CloseCode::Restart).await;
        } else {
            accept_and_hold(stream, Arc::new(Mutex::new(None))).await;
        }
    })
    .await;

    let channel = channel_for(&server.url, 5);
    let mut states = channel.watch_state();
    channel.connect("1", "token").await.unwrap();

    wait_for_state(&mut states, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
    wait_for_state(&mut states, |s| *s == ConnectionState::Connected).await;
    assert_eq!(server.accepts(), 2);
    wait_until(|| channel.is_connected()).await;
}

// =============================================================================
// Manual and normal closes
// =============================================================================

#[tokio::test]
async fn disconnect_sends_normal_close_and_stays_down() {
    let close_code = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&close_code);
    let server = ScriptedServer::start(move |_, stream| {
        accept_and_hold(stream, Arc::clone(&recorded))
    })
    .await;

    let channel = channel_for(&server.url, 5);
    channel.connect("1", "token").await.unwrap();
    assert!(channel.is_connected());

    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    wait_until(|| close_code.lock().is_some()).await;
    assert_eq!(*close_code.lock(), Some(1000));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.accepts(), 1, "no reconnect after manual disconnect");
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_while_reconnecting_stops_attempts() {
    let server = ScriptedServer::start(|index, stream| async move {
        if index == 0 {
            accept_then_close(stream, CloseCode::Error).await;
        }
    })
    .await;

    let channel = NotificationChannel::new(ChannelConfig {
        ws_url: Some(server.url.clone()),
        connect_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            max_attempts: 10,
            backoff: Backoff::Linear,
        },
    });
    let mut states = channel.watch_state();
    channel.connect("1", "token").await.unwrap();
    wait_for_state(&mut states, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;

    channel.disconnect();
    let attempts = server.accepts();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.accepts(), attempts);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn normal_close_from_server_does_not_reconnect() {
    let server = ScriptedServer::start(|_, stream| async move {
        accept_then_close(stream, CloseCode::Normal).await;
    })
    .await;

    let channel = channel_for(&server.url, 5);
    let mut states = channel.watch_state();
    channel.connect("1", "token").await.unwrap();

    wait_for_state(&mut states, |s| *s == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepts(), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_replaces_existing_connection() {
    let close_code = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&close_code);
    let server = ScriptedServer::start(move |index, stream| {
        let recorded = if index == 0 {
            Arc::clone(&recorded)
        } else {
            Arc::new(Mutex::new(None))
        };
        accept_and_hold(stream, recorded)
    })
    .await;

    let channel = channel_for(&server.url, 5);
    channel.connect("1", "token").await.unwrap();
    channel.connect("1", "token").await.unwrap();

    wait_until(|| close_code.lock().is_some()).await;
    assert_eq!(*close_code.lock(), Some(1000));
    assert!(channel.is_connected());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepts(), 2);
}

#[tokio::test]
async fn replaced_sessions_leave_the_new_queue_usable() {
    let closes = Arc::new(AtomicUsize::new(0));
    let texts = Arc::new(AtomicUsize::new(0));
    let (close_count, text_count) = (Arc::clone(&closes), Arc::clone(&texts));
    let server = ScriptedServer::start(move |_, stream| {
        let (closes, texts) = (Arc::clone(&close_count), Arc::clone(&text_count));
        async move {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(_) => {
                        texts.fetch_add(1, Ordering::SeqCst);
                    }
                    Message::Close(_) => {
                        closes.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }
            }
        }
    })
    .await;

    let channel = channel_for(&server.url, 5);
    for _ in 0..10 {
        channel.connect("1", "token").await.unwrap();
    }

    // Every replaced supervisor has wound down once its close is seen.
    wait_until(|| closes.load(Ordering::SeqCst) == 9).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(channel.is_connected());
    channel.ping().unwrap();
    wait_until(|| texts.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.accepts(), 10);
}

// =============================================================================
// Against the reference server
// =============================================================================

#[tokio::test]
async fn server_restart_close_reconnects_with_same_credentials() {
    let (addr, state, _handle) = taskflow_server::api::start_server("127.0.0.1:0")
        .await
        .unwrap();
    let user = state
        .store
        .register(RegisterInput {
            username: "bob".into(),
            email: "bob@example.com".into(),
            password: "pw".into(),
            full_name: None,
        })
        .await
        .unwrap();
    let token = state.store.login("bob", "pw").await.unwrap();

    let channel = channel_for(&format!("ws://{addr}"), 5);
    let mut states = channel.watch_state();
    channel
        .connect(&user.id, &token.access_token)
        .await
        .unwrap();
    let hub_state = Arc::clone(&state);
    let user_id = user.id.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub_state.hub.connection_count(&user_id).await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    state.hub.close_all(1012).await;
    wait_for_state(&mut states, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
    wait_for_state(&mut states, |s| *s == ConnectionState::Connected).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while state.hub.connection_count(&user.id).await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(channel.is_connected());
    channel.disconnect();
}
