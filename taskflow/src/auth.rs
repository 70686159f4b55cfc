//! Authentication client (`/auth/login`, `/auth/register`, `/auth/me`).
//!
//! Login uses the OAuth2 password-grant form shape. A successful login stores
//! the token in the shared [`Session`], which every transport built on the
//! same session then attaches to its requests.

use serde_json::Value;
use taskflow_proto::auth::{LoginForm, RegisterInput, Token, User};

use crate::http::{ApiRequest, HttpError, HttpTransport, Session};

/// Errors from the authentication endpoints.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request failed.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The server answered with an unexpected payload.
    #[error("unexpected auth response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl AuthError {
    /// User-facing message: the server's reason when it sent one.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Http(err) => err
                .server_message()
                .map_or_else(|| err.to_string(), str::to_string),
            Self::Decode(_) => self.to_string(),
        }
    }
}

/// Login, registration and identity lookup over an [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct AuthClient<T> {
    transport: T,
    session: Session,
}

impl<T: HttpTransport> AuthClient<T> {
    /// Creates a client that stores tokens in `session`.
    pub const fn new(transport: T, session: Session) -> Self {
        Self { transport, session }
    }

    /// The session tokens are stored in.
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Exchanges credentials for a token and stores it in the session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Http`] for rejected credentials or transport
    /// failures.
    pub async fn login(&self, username: &str, password: &str) -> Result<Token, AuthError> {
        let form = LoginForm::password_grant(username, password);
        let request = ApiRequest::post("/auth/login").form(vec![
            ("grant_type".to_string(), form.grant_type),
            ("username".to_string(), form.username),
            ("password".to_string(), form.password),
        ]);
        let token: Token = serde_json::from_value(self.transport.send(request).await?)?;
        self.session.set_token(token.access_token.clone());
        tracing::info!(username, "logged in");
        Ok(token)
    }

    /// Creates an account. Does not log in.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Http`] if the server rejects the registration.
    pub async fn register(&self, input: &RegisterInput) -> Result<User, AuthError> {
        let body = serde_json::to_value(input)?;
        let value = self
            .transport
            .send(ApiRequest::post("/auth/register").json(body))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Returns the account the current token belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Http`] with [`HttpError::Unauthorized`] when the
    /// token is missing or expired.
    pub async fn me(&self) -> Result<User, AuthError> {
        let value: Value = self.transport.send(ApiRequest::get("/auth/me")).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Forgets the token locally.
    pub fn logout(&self) {
        self.session.clear();
        tracing::info!("logged out");
    }
}
