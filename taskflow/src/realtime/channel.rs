//! WebSocket client for the notification endpoint.
//!
//! Each successful [`NotificationChannel::connect`] starts a supervisor task
//! that owns the socket. When the socket closes for any reason other than a
//! normal (1000) close or a manual [`disconnect`](NotificationChannel::disconnect),
//! the supervisor reconnects following the [`ReconnectPolicy`]. Every
//! connect or disconnect bumps a generation counter; a supervisor whose
//! generation is stale stops without touching shared state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use taskflow_proto::codec;
use taskflow_proto::notification::{ClientMessage, Notification, ServerMessage};

use super::handlers::{Handler, HandlerId, HandlerRegistry};
use super::{ChannelConfig, ConnectionState, RealtimeError, map_ws_connect_error, notification_url};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSender = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Capacity of the notification broadcast channel.
const NOTIFICATION_BUFFER: usize = 64;

/// Close code for a normal closure.
const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug, Clone)]
struct Credentials {
    user_id: String,
    token: String,
}

#[derive(Debug, Default)]
struct Link {
    credentials: Option<Credentials>,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ChannelInner {
    config: ChannelConfig,
    link: Mutex<Link>,
    handlers: HandlerRegistry,
    state: watch::Sender<ConnectionState>,
    notifications: broadcast::Sender<Notification>,
    unread: AtomicU64,
    last_pong: Mutex<Option<Instant>>,
}

/// Reconnecting client for `/ws/notifications/{user_id}`.
///
/// Cloning is cheap; clones share the connection, handlers and counters.
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    inner: Arc<ChannelInner>,
}

/// Halves of one live socket session.
struct Session {
    reader: WsReader,
    writer: WsSender,
    outgoing: mpsc::UnboundedReceiver<Message>,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Close frame received, with its code if it carried one.
    Closed(Option<u16>),
    /// Read error or the stream ended without a close frame.
    Dropped,
    /// Our own close frame was sent.
    Local,
}

impl NotificationChannel {
    /// Creates a disconnected channel.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                link: Mutex::new(Link::default()),
                handlers: HandlerRegistry::new(),
                state,
                notifications,
                unread: AtomicU64::new(0),
                last_pong: Mutex::new(None),
            }),
        }
    }

    /// Opens the notification socket for `user_id`, closing any existing
    /// connection first. Resolves once the socket is open.
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::Unavailable`] if no WebSocket URL is configured.
    /// - [`RealtimeError::InvalidUrl`] if the URL cannot be built.
    /// - [`RealtimeError::Timeout`] / [`RealtimeError::Connect`] if the
    ///   socket cannot be opened.
    pub async fn connect(&self, user_id: &str, token: &str) -> Result<(), RealtimeError> {
        let Some(base) = self.inner.config.ws_url.as_deref() else {
            tracing::warn!("realtime notifications unavailable: no websocket url configured");
            return Err(RealtimeError::Unavailable);
        };
        let url = notification_url(base, user_id, token)?;

        let generation = {
            let mut link = self.inner.link.lock();
            link.generation += 1;
            link.credentials = Some(Credentials {
                user_id: user_id.to_string(),
                token: token.to_string(),
            });
            close_link(&mut link);
            link.generation
        };
        self.inner.set_state(ConnectionState::Connecting);
        tracing::info!(user_id, "connecting to notifications");

        let stream = match self.inner.open(url.as_str()).await {
            Ok(stream) => stream,
            Err(e) => {
                if self.inner.is_current(generation) {
                    self.inner.set_state(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        let mut link = self.inner.link.lock();
        if link.generation != generation {
            drop(link);
            tracing::debug!("connection superseded while opening");
            return Err(RealtimeError::Connect("connection superseded".to_string()));
        }
        let session = attach(&mut link, stream);
        let inner = Arc::clone(&self.inner);
        link.supervisor = Some(tokio::spawn(supervise(inner, generation, session)));
        drop(link);

        self.inner.set_state(ConnectionState::Connected);
        tracing::info!(user_id, "notifications connected");
        Ok(())
    }

    /// Closes the socket with a normal close and stops any reconnecting.
    pub fn disconnect(&self) {
        let mut link = self.inner.link.lock();
        link.generation += 1;
        link.credentials = None;
        close_link(&mut link);
        drop(link);
        self.inner.set_state(ConnectionState::Disconnected);
        tracing::info!("notifications disconnected");
    }

    /// Reconnects with the last credentials, e.g. after reconnecting gave up.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] if the channel was never
    /// connected or was disconnected manually, or any error from
    /// [`connect`](Self::connect).
    pub async fn retry(&self) -> Result<(), RealtimeError> {
        let credentials = self
            .inner
            .link
            .lock()
            .credentials
            .clone()
            .ok_or(RealtimeError::NotConnected)?;
        self.connect(&credentials.user_id, &credentials.token).await
    }

    /// Whether the state is [`ConnectionState::Connected`] and the socket
    /// writer is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
            && self
                .inner
                .link
                .lock()
                .outgoing
                .as_ref()
                .is_some_and(|tx| !tx.is_closed())
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Sends a message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] (after logging) if there is no
    /// open connection; nothing is sent.
    pub fn send_message(&self, message: &ClientMessage) -> Result<(), RealtimeError> {
        let tx = if self.is_connected() {
            self.inner.link.lock().outgoing.clone()
        } else {
            None
        };
        let Some(tx) = tx else {
            tracing::error!(kind = message.kind(), "cannot send: notifications not connected");
            return Err(RealtimeError::NotConnected);
        };
        let text = codec::encode_client(message).map_err(|e| RealtimeError::Encode(e.to_string()))?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| RealtimeError::NotConnected)
    }

    /// Asks the server to push `new_notification` frames.
    ///
    /// # Errors
    ///
    /// See [`send_message`](Self::send_message).
    pub fn subscribe_to_notifications(&self) -> Result<(), RealtimeError> {
        self.send_message(&ClientMessage::SubscribeToNotifications)
    }

    /// Asks the server for the unread count.
    ///
    /// # Errors
    ///
    /// See [`send_message`](Self::send_message).
    pub fn get_unread_count(&self) -> Result<(), RealtimeError> {
        self.send_message(&ClientMessage::GetUnreadCount)
    }

    /// Sends a liveness ping; the server answers `pong`.
    ///
    /// # Errors
    ///
    /// See [`send_message`](Self::send_message).
    pub fn ping(&self) -> Result<(), RealtimeError> {
        self.send_message(&ClientMessage::Ping)
    }

    /// Registers `handler` for frames of `event_type`. Handlers for one type
    /// run in registration order, before the built-in handling.
    pub fn on<F>(&self, event_type: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.inner.handlers.on(event_type, handler)
    }

    /// Removes a handler registered with [`on`](Self::on).
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        self.inner.handlers.off(event_type, id)
    }

    /// Unread count as last reported by the server, plus notifications
    /// received since.
    #[must_use]
    pub fn unread_count(&self) -> u64 {
        self.inner.unread.load(Ordering::Relaxed)
    }

    /// Stream of notifications pushed by the server.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// When the last `pong` arrived.
    #[must_use]
    pub fn last_pong(&self) -> Option<Instant> {
        *self.inner.last_pong.lock()
    }

    /// Feeds one text frame through dispatch as if the server had sent it.
    pub fn handle_frame(&self, text: &str) {
        self.inner.dispatch(text);
    }
}

/// Sends a normal close on the current socket (if any) and stops its
/// supervisor. The caller has already bumped the generation.
fn close_link(link: &mut Link) {
    let outgoing = link.outgoing.take();
    let supervisor = link.supervisor.take();
    match (outgoing, supervisor) {
        (Some(tx), _) if !tx.is_closed() => {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            };
            let _ = tx.send(Message::Close(Some(frame)));
        }
        (_, Some(handle)) => handle.abort(),
        _ => {}
    }
}

/// Splits a fresh socket and publishes its outgoing queue.
fn attach(link: &mut Link, stream: WsStream) -> Session {
    let (writer, reader) = stream.split();
    let (tx, outgoing) = mpsc::unbounded_channel();
    link.outgoing = Some(tx);
    Session {
        reader,
        writer,
        outgoing,
    }
}

/// Runs sessions for one generation, reconnecting after abnormal closes.
async fn supervise(inner: Arc<ChannelInner>, generation: u64, first: Session) {
    let mut session = first;
    loop {
        let end = inner.run_session(session).await;
        {
            let mut link = inner.link.lock();
            if link.generation != generation {
                tracing::debug!(?end, "session ended after disconnect");
                return;
            }
            link.outgoing = None;
        }
        match end {
            SessionEnd::Closed(Some(NORMAL_CLOSE)) | SessionEnd::Local => {
                tracing::info!("notification socket closed normally");
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Closed(code) => {
                tracing::warn!(?code, "notification socket closed unexpectedly");
            }
            SessionEnd::Dropped => {
                tracing::warn!("notification socket dropped");
            }
        }
        match inner.reconnect(generation).await {
            Some(next) => session = next,
            None => return,
        }
    }
}

impl ChannelInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link.lock().generation == generation
    }

    async fn open(&self, url: &str) -> Result<WsStream, RealtimeError> {
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!("notification socket connect timed out");
                RealtimeError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(err = %e, "notification socket connect failed");
                map_ws_connect_error(e)
            })?;
        Ok(stream)
    }

    /// Runs reconnect attempts until one succeeds, the generation goes
    /// stale, or the attempt cap is reached.
    async fn reconnect(&self, generation: u64) -> Option<Session> {
        let policy = self.config.reconnect;
        for attempt in 1..=policy.max_attempts {
            if !self.is_current(generation) {
                return None;
            }
            self.set_state(ConnectionState::Reconnecting { attempt });
            let delay = policy.delay_for(attempt);
            tracing::info!(attempt, delay_ms = delay_ms(delay), "reconnecting to notifications");
            tokio::time::sleep(delay).await;

            let credentials = {
                let link = self.link.lock();
                if link.generation != generation {
                    return None;
                }
                link.credentials.clone()
            }?;
            let url = match notification_url(
                self.config.ws_url.as_deref().unwrap_or_default(),
                &credentials.user_id,
                &credentials.token,
            ) {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!(err = %e, "cannot rebuild notification url");
                    break;
                }
            };

            match self.open(url.as_str()).await {
                Ok(stream) => {
                    let mut link = self.link.lock();
                    if link.generation != generation {
                        return None;
                    }
                    let session = attach(&mut link, stream);
                    drop(link);
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(attempt, "notifications reconnected");
                    return Some(session);
                }
                Err(e) => tracing::warn!(attempt, err = %e, "reconnect attempt failed"),
            }
        }
        if self.is_current(generation) {
            tracing::error!(
                attempts = policy.max_attempts,
                "giving up reconnecting to notifications"
            );
            self.set_state(ConnectionState::Exhausted);
        }
        None
    }

    /// Pumps one socket until it closes. Outgoing frames are written in
    /// order; a locally sent close frame ends the session.
    async fn run_session(&self, session: Session) -> SessionEnd {
        let Session {
            mut reader,
            mut writer,
            mut outgoing,
        } = session;

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        tracing::info!(?code, "server closed notification socket");
                        return SessionEnd::Closed(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(err = %e, "notification socket error");
                        return SessionEnd::Dropped;
                    }
                    None => return SessionEnd::Dropped,
                },
                msg = outgoing.recv() => {
                    let Some(msg) = msg else {
                        return SessionEnd::Local;
                    };
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = writer.send(msg).await {
                        tracing::warn!(err = %e, "notification socket write failed");
                        return SessionEnd::Dropped;
                    }
                    if closing {
                        return SessionEnd::Local;
                    }
                }
            }
        }
    }

    /// Parses a frame and runs user handlers, then built-in handling.
    /// Malformed frames are logged and dropped.
    fn dispatch(&self, text: &str) {
        let frame = match codec::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(err = %e, "malformed notification frame, skipping");
                return;
            }
        };
        self.handlers.dispatch(frame.kind(), frame.body());

        match frame.to_server_message() {
            Ok(ServerMessage::NewNotification { notification }) => {
                self.unread.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = %notification.id, kind = %notification.kind, "notification received");
                let _ = self.notifications.send(notification);
            }
            Ok(ServerMessage::UnreadCount { count }) => {
                self.unread.store(count, Ordering::Relaxed);
            }
            Ok(ServerMessage::Pong { .. }) => {
                *self.last_pong.lock() = Some(Instant::now());
            }
            Ok(ServerMessage::AuthSuccess { user_id }) => {
                tracing::info!(user_id = user_id.as_deref().unwrap_or("?"), "notification socket authenticated");
                self.subscribe();
            }
            Ok(ServerMessage::AuthError { message }) => {
                tracing::error!(message = message.as_deref().unwrap_or(""), "notification auth failed");
            }
            Ok(ServerMessage::Error { message }) => {
                tracing::warn!(message = message.as_deref().unwrap_or(""), "notification server error");
            }
            Err(_) => {
                tracing::debug!(kind = frame.kind(), "unhandled notification message type");
            }
        }
    }

    fn subscribe(&self) {
        let Some(tx) = self.link.lock().outgoing.clone() else {
            return;
        };
        match codec::encode_client(&ClientMessage::SubscribeToNotifications) {
            Ok(text) => {
                let _ = tx.send(Message::Text(text.into()));
            }
            Err(e) => tracing::error!(err = %e, "failed to encode subscribe message"),
        }
    }
}

fn delay_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
