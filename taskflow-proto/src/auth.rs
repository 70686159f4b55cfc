//! Authentication payloads (`/auth/login`, `/auth/register`, `/auth/me`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth2 password-grant token response from `POST /auth/login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Bearer token to attach to every request.
    pub access_token: String,
    /// Token type, normally `bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Form fields of `POST /auth/login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginForm {
    /// Always `password`.
    pub grant_type: String,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl LoginForm {
    /// Builds a password-grant login form.
    pub fn password_grant(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            grant_type: "password".to_string(),
            username: username.into(),
            password: password.into(),
        }
    }
}

/// JSON body of `POST /auth/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterInput {
    /// Desired account name.
    pub username: String,
    /// Contact address.
    pub email: String,
    /// Account password.
    pub password: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// A user account as returned by `/auth/register` and `/auth/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Server-assigned identifier (also used in the notification URL).
    pub id: String,
    /// Account name.
    pub username: String,
    /// Contact address.
    #[serde(default)]
    pub email: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    /// Account creation time, if the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}
