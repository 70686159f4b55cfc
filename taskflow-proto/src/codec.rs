//! JSON encoding and decoding for notification channel frames.
//!
//! Decoding happens in two steps. [`decode_frame`] accepts any JSON object
//! with a string `type` field and yields a [`Frame`]; [`Frame::to_server_message`]
//! then interprets the frame as one of the known [`ServerMessage`] kinds.
//! Keeping the steps apart lets a client dispatch frames of kinds it does
//! not model to user-registered handlers.

use serde::Deserialize as _;
use serde_json::Value;

use crate::notification::{ClientMessage, ServerMessage};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not valid JSON or does not match the expected shape.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The JSON is valid but is not an object with a string `type` field.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A decoded envelope: the `type` tag plus the full JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    kind: String,
    body: Value,
}

impl Frame {
    /// Returns the `type` tag of the frame.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the whole frame object, including the `type` field.
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Interprets the frame as a known server message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the kind is unknown or the
    /// payload does not match the kind's schema.
    pub fn to_server_message(&self) -> Result<ServerMessage, CodecError> {
        Ok(ServerMessage::deserialize(&self.body)?)
    }
}

/// Parses a text frame into a [`Frame`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` for invalid JSON, or
/// `CodecError::InvalidEnvelope` if the JSON is not an object carrying a
/// string `type` field.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let body: Value = serde_json::from_str(text)?;
    let Some(object) = body.as_object() else {
        return Err(CodecError::InvalidEnvelope(
            "frame is not a JSON object".to_string(),
        ));
    };
    let Some(kind) = object.get("type").and_then(Value::as_str) else {
        return Err(CodecError::InvalidEnvelope(
            "frame has no string `type` field".to_string(),
        ));
    };
    Ok(Frame {
        kind: kind.to_string(),
        body,
    })
}

/// Encodes a client message as a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if serialization fails.
pub fn encode_client(msg: &ClientMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decodes a JSON text frame sent by a client.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a known client message.
pub fn decode_client(text: &str) -> Result<ClientMessage, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a server message as a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if serialization fails.
pub fn encode_server(msg: &ServerMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}
