//! API Errors
//!
//! Non-success responses carry an error envelope. The human-readable message
//! is taken from `detail`, falling back to `error`. Validation failures send a
//! list of objects whose `msg` fields are joined; any other structured value
//! is rendered as JSON.

use serde_json::Value;
use thiserror::Error;

/// Message used when the envelope carries nothing readable
pub const DEFAULT_ERROR_MESSAGE: &str = "Request failed";

/// Errors from the REST API
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered with a non-success status
    #[error("{message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Message extracted from the error envelope
        message: String,
    },

    /// The request did not complete
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The configured base URL is unusable
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Reading a local file for upload failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Build a status error from a response body
    #[must_use]
    pub fn from_response(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            message: extract_error_message(body),
        }
    }

    /// HTTP status, when the server answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the server rejected the credentials
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

/// Extract the readable message from an error body
#[must_use]
pub fn extract_error_message(body: &str) -> String {
    let Ok(envelope) = serde_json::from_str::<Value>(body) else {
        return DEFAULT_ERROR_MESSAGE.to_string();
    };

    let field = envelope
        .get("detail")
        .filter(|v| is_present(v))
        .or_else(|| envelope.get("error").filter(|v| is_present(v)));

    match field {
        None => DEFAULT_ERROR_MESSAGE.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item.get("msg") {
                Some(Value::String(msg)) => msg.clone(),
                _ => value_to_text(item),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => value_to_text(other),
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
