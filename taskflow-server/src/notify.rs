//! Notification WebSocket endpoint and per-user connection hub.
//!
//! A client connects to `/ws/notifications/{user_id}?token=...`. The token
//! must belong to `user_id`; otherwise the server sends `auth_error` and
//! closes with a policy-violation code. On success it sends `auth_success`
//! and answers `ping`, `get_unread_count` and `subscribe_to_notifications`.
//! Only subscribed connections receive `new_notification` pushes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};

use taskflow_proto::codec;
use taskflow_proto::notification::{ClientMessage, Notification, ServerMessage};

use crate::api::AppState;

/// One live notification socket.
#[derive(Debug)]
struct Connection {
    id: u64,
    subscribed: bool,
    sender: mpsc::UnboundedSender<Message>,
}

/// Registry of live notification sockets, grouped by user id.
#[derive(Debug, Default)]
pub struct NotificationHub {
    connections: RwLock<HashMap<String, Vec<Connection>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, user_id: &str, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(Connection {
                id,
                subscribed: false,
                sender,
            });
        id
    }

    async fn unregister(&self, user_id: &str, id: u64) {
        let mut conns = self.connections.write().await;
        if let Some(list) = conns.get_mut(user_id) {
            list.retain(|conn| conn.id != id);
            if list.is_empty() {
                conns.remove(user_id);
            }
        }
    }

    async fn subscribe(&self, user_id: &str, id: u64) {
        if let Some(list) = self.connections.write().await.get_mut(user_id) {
            for conn in list.iter_mut().filter(|conn| conn.id == id) {
                conn.subscribed = true;
            }
        }
    }

    /// Number of live sockets for a user.
    pub async fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .read()
            .await
            .get(user_id)
            .map_or(0, Vec::len)
    }

    /// Pushes a `new_notification` frame to every subscribed socket of the
    /// user. Returns how many sockets it was queued on.
    pub async fn publish(&self, user_id: &str, notification: Notification) -> usize {
        let msg = ServerMessage::NewNotification { notification };
        let text = match codec::encode_server(&msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode notification");
                return 0;
            }
        };
        let conns = self.connections.read().await;
        let Some(list) = conns.get(user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for conn in list.iter().filter(|conn| conn.subscribed) {
            if conn.sender.send(Message::Text(text.clone().into())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Sends a raw text frame to every socket of the user, subscribed or not.
    pub async fn send_raw(&self, user_id: &str, text: &str) -> usize {
        let conns = self.connections.read().await;
        conns.get(user_id).map_or(0, |list| {
            list.iter()
                .filter(|conn| conn.sender.send(Message::Text(text.to_owned().into())).is_ok())
                .count()
        })
    }

    /// Closes every socket with the given close code.
    ///
    /// Clients treat anything other than a normal (1000) close as a dropped
    /// connection and start reconnecting, so `close_code::RESTART` is the
    /// usual choice for simulating a server restart.
    pub async fn close_all(&self, code: u16) {
        let conns = self.connections.read().await;
        for (user_id, list) in conns.iter() {
            for conn in list {
                tracing::info!(user_id = %user_id, code, "closing notification socket");
                let _ = conn.sender.send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "server closing".into(),
                })));
            }
        }
    }
}

/// Query string of the notification endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Upgrades `/ws/notifications/{user_id}` to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, query.token, state))
}

/// Runs one notification socket until either side closes it.
async fn handle_socket(
    socket: WebSocket,
    user_id: String,
    token: Option<String>,
    state: Arc<AppState>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let authorized = match token.as_deref() {
        Some(token) => state
            .store
            .authenticate(token)
            .await
            .is_some_and(|user| user.id == user_id),
        None => false,
    };
    if !authorized {
        tracing::warn!(user_id = %user_id, "notification socket rejected");
        let reply = ServerMessage::AuthError {
            message: Some("invalid or missing token".to_string()),
        };
        if let Ok(text) = codec::encode_server(&reply) {
            let _ = ws_sender.send(Message::Text(text.into())).await;
        }
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.hub.register(&user_id, tx.clone()).await;
    tracing::info!(user_id = %user_id, conn_id, "notification socket opened");

    send_server_msg(
        &tx,
        &ServerMessage::AuthSuccess {
            user_id: Some(user_id.clone()),
        },
    );

    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %writer_user, "notification socket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_user = user_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_text(&reader_user, conn_id, text.as_str(), &reader_state, &tx)
                        .await;
                }
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_user, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.hub.unregister(&user_id, conn_id).await;
    tracing::info!(user_id = %user_id, conn_id, "notification socket closed");
}

async fn handle_client_text(
    user_id: &str,
    conn_id: u64,
    text: &str,
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    let reply = match codec::decode_client(text) {
        Ok(ClientMessage::Ping) => ServerMessage::Pong {
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        },
        Ok(ClientMessage::GetUnreadCount) => ServerMessage::UnreadCount {
            count: state.store.unread_count(user_id).await,
        },
        Ok(ClientMessage::SubscribeToNotifications) => {
            state.hub.subscribe(user_id, conn_id).await;
            tracing::debug!(user_id = %user_id, conn_id, "subscribed to notifications");
            ServerMessage::UnreadCount {
                count: state.store.unread_count(user_id).await,
            }
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "unrecognised client frame");
            ServerMessage::Error {
                message: Some(format!("unrecognised message: {e}")),
            }
        }
    };
    send_server_msg(tx, &reply);
}

fn send_server_msg(tx: &mpsc::UnboundedSender<Message>, msg: &ServerMessage) {
    match codec::encode_server(msg) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode server message"),
    }
}
