//! Notification channel message types.
//!
//! Every frame on the notification WebSocket is a JSON object whose `type`
//! field names the message kind, with the payload fields alongside it:
//!
//! ```text
//! {"type": "unread_count", "count": 3}
//! ```
//!
//! [`ServerMessage`] covers the kinds the server pushes, [`ClientMessage`]
//! the kinds a client may send. Frames of unknown kind are still valid
//! envelopes; see [`crate::codec::Frame`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-facing notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Server-assigned identifier.
    pub id: String,
    /// Short headline.
    #[serde(default)]
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub message: String,
    /// Free-form category (e.g. `task_created`, `reminder`).
    #[serde(default)]
    pub kind: String,
    /// Whether the user has read it.
    #[serde(default)]
    pub read: bool,
    /// Task the notification refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// When the notification was created.
    pub created_at: DateTime<Utc>,
}

/// Messages the server sends to a notification client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A new notification for the connected user.
    NewNotification {
        /// The notification itself.
        notification: Notification,
    },
    /// The number of unread notifications.
    UnreadCount {
        /// Unread notifications for the user.
        count: u64,
    },
    /// Liveness reply to a client `ping`.
    Pong {
        /// Server time in milliseconds, when provided.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// The token in the connection URL was accepted.
    AuthSuccess {
        /// The authenticated user.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// The token in the connection URL was rejected.
    AuthError {
        /// Reason given by the server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Any other server-side failure.
    Error {
        /// Reason given by the server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    /// Returns the wire `type` tag of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NewNotification { .. } => kinds::NEW_NOTIFICATION,
            Self::UnreadCount { .. } => kinds::UNREAD_COUNT,
            Self::Pong { .. } => kinds::PONG,
            Self::AuthSuccess { .. } => kinds::AUTH_SUCCESS,
            Self::AuthError { .. } => kinds::AUTH_ERROR,
            Self::Error { .. } => kinds::ERROR,
        }
    }
}

/// Messages a notification client sends to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving `new_notification` pushes.
    SubscribeToNotifications,
    /// Ask for an `unread_count` reply.
    GetUnreadCount,
    /// Ask for a `pong` reply.
    Ping,
}

impl ClientMessage {
    /// Returns the wire `type` tag of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SubscribeToNotifications => kinds::SUBSCRIBE_TO_NOTIFICATIONS,
            Self::GetUnreadCount => kinds::GET_UNREAD_COUNT,
            Self::Ping => kinds::PING,
        }
    }
}

/// Wire `type` tags, for registering handlers by name.
pub mod kinds {
    /// Server: new notification.
    pub const NEW_NOTIFICATION: &str = "new_notification";
    /// Server: unread count.
    pub const UNREAD_COUNT: &str = "unread_count";
    /// Server: ping reply.
    pub const PONG: &str = "pong";
    /// Server: token accepted.
    pub const AUTH_SUCCESS: &str = "auth_success";
    /// Server: token rejected.
    pub const AUTH_ERROR: &str = "auth_error";
    /// Server: generic error.
    pub const ERROR: &str = "error";
    /// Client: subscribe.
    pub const SUBSCRIBE_TO_NOTIFICATIONS: &str = "subscribe_to_notifications";
    /// Client: unread count request.
    pub const GET_UNREAD_COUNT: &str = "get_unread_count";
    /// Client: ping.
    pub const PING: &str = "ping";
}
