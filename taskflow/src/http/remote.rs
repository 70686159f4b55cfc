//! Production HTTP transport over `reqwest`.
//!
//! Every request carries the session's bearer token when one is present and
//! is bounded by a fixed timeout. A 401 clears the session, which publishes
//! [`SessionEvent::LoggedOut`](super::SessionEvent::LoggedOut) so the UI can
//! return to the login screen.

use std::time::Duration;

use serde_json::Value;

use super::{ApiRequest, Body, HttpError, HttpTransport, Method, Session, server_message};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// REST transport bound to one API base URL.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    session: Session,
}

impl ReqwestTransport {
    /// Creates a transport for `base_url` (e.g. `http://127.0.0.1:8000`).
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Network`] if the HTTP client cannot be built
    /// (for example when no TLS backend is available).
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        session: Session,
    ) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Network(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    /// The session whose token this transport attaches.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// The API base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

const fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Network(err.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<Value, HttpError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(to_reqwest(request.method), &url);
        if let Some(token) = self.session.token() {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            Some(Body::Json(value)) => builder.json(value),
            Some(Body::Form(fields)) => builder.form(fields),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(method = %request.method, path = %request.path, error = %e, "request failed");
            map_reqwest_error(&e)
        })?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| map_reqwest_error(&e))?;

        if !status.is_success() {
            let message = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|body| server_message(&body));
            tracing::debug!(
                method = %request.method,
                path = %request.path,
                status = status.as_u16(),
                "request rejected"
            );
            if status == reqwest::StatusCode::UNAUTHORIZED {
                if self.session.is_authenticated() {
                    tracing::info!("session expired, clearing token");
                }
                self.session.clear();
                return Err(HttpError::Unauthorized { message });
            }
            return Err(HttpError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| HttpError::Decode(e.to_string()))
    }
}
