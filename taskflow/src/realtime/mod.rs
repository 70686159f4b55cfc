//! Realtime notification channel.
//!
//! A reconnecting, authenticated WebSocket client for
//! `/ws/notifications/{user_id}?token=...`. Incoming JSON frames are
//! dispatched to user handlers registered per message type, then to the
//! built-in handlers (unread count, notification stream, auto-subscribe).
//!
//! - [`channel::NotificationChannel`]: the client and its reconnect loop
//! - [`handlers::HandlerRegistry`]: ordered handlers per message type
//! - [`backoff::ReconnectPolicy`]: delay schedule and attempt cap

pub mod backoff;
pub mod channel;
pub mod handlers;

use std::fmt;
use std::time::Duration;

pub use backoff::{Backoff, ReconnectPolicy};
pub use channel::NotificationChannel;
pub use handlers::{HandlerId, HandlerRegistry};

/// Default timeout for opening the WebSocket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors reported by [`NotificationChannel`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    /// No WebSocket endpoint is configured.
    #[error("realtime notifications are not available")]
    Unavailable,

    /// The endpoint URL could not be built.
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),

    /// Opening the socket took longer than the connect timeout.
    #[error("websocket connect timed out")]
    Timeout,

    /// Opening the socket failed.
    #[error("websocket connect failed: {0}")]
    Connect(String),

    /// There is no open connection to send on.
    #[error("not connected")]
    NotConnected,

    /// An outgoing message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Lifecycle of a [`NotificationChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// Waiting for or running reconnect attempt `attempt` (1-based).
    Reconnecting {
        /// Attempt number.
        attempt: u32,
    },
    /// Every reconnect attempt failed; nothing more is scheduled until
    /// [`NotificationChannel::retry`] is called.
    Exhausted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Exhausted => f.write_str("gave up reconnecting"),
        }
    }
}

/// Settings for a [`NotificationChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// WebSocket base URL (`ws://host:port`). `None` disables the channel.
    pub ws_url: Option<String>,
    /// Timeout for each connection attempt.
    pub connect_timeout: Duration,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChannelConfig {
    /// Config for `ws_url` with default timeouts and reconnect policy.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: Some(ws_url.into()),
            ..Self::default()
        }
    }
}

/// Builds `{base}/ws/notifications/{user_id}?token={token}` with the user id
/// and token percent-encoded.
///
/// # Errors
///
/// Returns [`RealtimeError::InvalidUrl`] if `base` is not a `ws://` or
/// `wss://` URL.
pub fn notification_url(base: &str, user_id: &str, token: &str) -> Result<url::Url, RealtimeError> {
    let mut url = url::Url::parse(base).map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(RealtimeError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    url.path_segments_mut()
        .map_err(|()| RealtimeError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(["ws", "notifications", user_id]);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

/// Maps a `tokio_tungstenite` connection error to a [`RealtimeError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> RealtimeError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => {
            RealtimeError::Connect(format!("HTTP error: status {}", response.status()))
        }
        WsError::Url(e) => RealtimeError::InvalidUrl(e.to_string()),
        other => RealtimeError::Connect(other.to_string()),
    }
}
