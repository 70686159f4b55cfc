//! HTTP transport abstraction.
//!
//! Defines the [`HttpTransport`] trait every REST call goes through, plus the
//! shared [`Session`] holding the bearer token. Implementations:
//! - [`remote::ReqwestTransport`]: production transport over `reqwest`
//! - [`loopback::LoopbackTransport`]: in-process task API for tests and
//!   offline demos

pub mod loopback;
pub mod remote;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;

/// HTTP method of an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// `application/json`
    Json(Value),
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
}

/// A request relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path starting with `/`, e.g. `/tasks/42`.
    pub path: String,
    /// Optional body.
    pub body: Option<Body>,
}

impl ApiRequest {
    /// Creates a body-less request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    /// `GET path`
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// `POST path`
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// `PUT path`
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    /// `PATCH path`
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    /// `DELETE path`
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Attaches a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    /// Attaches a form-encoded body.
    #[must_use]
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Form(fields));
        self
    }
}

/// Errors produced by an [`HttpTransport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// The request did not complete within the transport timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure (DNS, refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The server answered 401; the session token has been cleared.
    #[error("not authenticated")]
    Unauthorized {
        /// Server-provided message, if any.
        message: Option<String>,
    },

    /// Any other non-success status.
    #[error("server returned {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-provided message (`detail` or `message` field), if any.
        message: Option<String>,
    },

    /// The response body was not valid JSON.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl HttpError {
    /// Server-provided message carried by this error, if any.
    #[must_use]
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Unauthorized { message } | Self::Status { message, .. } => message.as_deref(),
            _ => None,
        }
    }

    /// HTTP status carried by this error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { .. } => Some(401),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Async transport for JSON REST calls.
///
/// A successful call yields the decoded JSON body; an empty body decodes as
/// [`Value::Null`].
pub trait HttpTransport: Send + Sync + 'static {
    /// Sends one request and waits for the decoded response.
    fn send(
        &self,
        request: ApiRequest,
    ) -> impl std::future::Future<Output = Result<Value, HttpError>> + Send;
}

/// Extracts the human-readable message from an error body.
///
/// Understands `{"detail": "..."}`, `{"message": "..."}` and validation
/// lists of the form `{"detail": [{"msg": "..."}]}`.
#[must_use]
pub fn server_message(body: &Value) -> Option<String> {
    let field = body.get("detail").or_else(|| body.get("message"))?;
    match field {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("msg").and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Change of authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// No change yet.
    Idle,
    /// A token was stored.
    LoggedIn,
    /// The token was cleared, locally or because the server answered 401.
    /// UIs react by sending the user back to the login screen.
    LoggedOut,
}

/// Shared bearer-token holder.
///
/// Cloning is cheap; all clones see the same token and event stream.
#[derive(Debug, Clone)]
pub struct Session {
    token: Arc<RwLock<Option<String>>>,
    events: Arc<watch::Sender<SessionEvent>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Session {
    /// Creates a session, optionally already holding a token.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        let (events, _) = watch::channel(SessionEvent::Idle);
        Self {
            token: Arc::new(RwLock::new(token)),
            events: Arc::new(events),
        }
    }

    /// Current token, if any.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Whether a token is present.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    /// Stores a token and announces [`SessionEvent::LoggedIn`].
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
        self.events.send_replace(SessionEvent::LoggedIn);
    }

    /// Clears the token and announces [`SessionEvent::LoggedOut`].
    pub fn clear(&self) {
        self.token.write().take();
        self.events.send_replace(SessionEvent::LoggedOut);
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
