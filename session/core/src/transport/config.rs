//! Transport Configuration
//!
//! Where the real-time channel lives and how the client negotiates,
//! retries and times out.

use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::traits::TransportError;

/// Engine.IO protocol revision spoken by the client
pub const ENGINE_IO_VERSION: &str = "4";

/// Underlying transport kind, tried in configured order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Full-duplex WebSocket
    #[serde(alias = "ws")]
    WebSocket,
    /// HTTP long-polling
    Polling,
}

impl TransportKind {
    /// Value of the `transport` query parameter
    #[must_use]
    pub fn as_query(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_query())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "polling" | "poll" => Ok(Self::Polling),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}

/// Real-time transport configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Backend base URL (`http://host:port`)
    pub url: String,

    /// Mount path of the real-time endpoint
    pub path: String,

    /// Transport kinds in negotiation order
    pub transports: Vec<TransportKind>,

    /// Whether to reconnect after a lost connection
    pub reconnection: bool,

    /// Reconnection attempts before giving up
    pub reconnect_attempts: u32,

    /// Fixed delay between reconnection attempts in milliseconds
    pub reconnect_delay_ms: u64,

    /// Timeout for one connection attempt in milliseconds
    pub connect_timeout_ms: u64,

    /// Send stored cookies with the handshake
    pub with_credentials: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            path: "socket.io".to_string(),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            reconnection: true,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            connect_timeout_ms: 20_000,
            with_credentials: true,
        }
    }
}

impl TransportConfig {
    /// Configuration for a backend at `url` with default settings
    #[must_use]
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CHAT_BACKEND_URL`: backend base URL
    /// - `CHAT_TRANSPORTS`: comma-separated order, e.g. "websocket,polling"
    /// - `CHAT_RECONNECT_ATTEMPTS`: number of reconnection attempts
    /// - `CHAT_RECONNECT_DELAY`: delay between attempts in ms
    /// - `CHAT_CONNECT_TIMEOUT`: connection timeout in ms
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let transports = std::env::var("CHAT_TRANSPORTS")
            .ok()
            .and_then(|v| parse_transport_list(&v).ok())
            .unwrap_or(defaults.transports);

        Self {
            url: std::env::var("CHAT_BACKEND_URL").unwrap_or(defaults.url),
            path: defaults.path,
            transports,
            reconnection: defaults.reconnection,
            reconnect_attempts: std::env::var("CHAT_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.reconnect_attempts),
            reconnect_delay_ms: std::env::var("CHAT_RECONNECT_DELAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.reconnect_delay_ms),
            connect_timeout_ms: std::env::var("CHAT_CONNECT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_ms),
            with_credentials: defaults.with_credentials,
        }
    }

    /// Engine.IO endpoint for a transport kind
    ///
    /// WebSocket endpoints use the `ws`/`wss` scheme. `sid` is appended for
    /// requests within an established polling session.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is not a valid http(s) URL.
    pub fn endpoint(&self, kind: TransportKind, sid: Option<&str>) -> Result<Url, TransportError> {
        let base = Url::parse(&self.url)
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid URL {}: {e}", self.url)))?;
        let mut url = base
            .join(&format!("{}/", self.path.trim_matches('/')))
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair("EIO", ENGINE_IO_VERSION);
            query.append_pair("transport", kind.as_query());
            if let Some(sid) = sid {
                query.append_pair("sid", sid);
            }
        }

        if kind == TransportKind::WebSocket {
            let scheme = match url.scheme() {
                "https" | "wss" => "wss",
                "http" | "ws" => "ws",
                other => {
                    return Err(TransportError::ConnectionFailed(format!(
                        "unsupported scheme `{other}`"
                    )))
                }
            };
            url.set_scheme(scheme).map_err(|()| {
                TransportError::ConnectionFailed(format!("cannot use scheme {scheme}"))
            })?;
        }

        Ok(url)
    }
}

/// Parse a comma-separated transport order
///
/// # Errors
///
/// Returns an error for unknown names or an empty list.
pub fn parse_transport_list(value: &str) -> Result<Vec<TransportKind>, String> {
    let kinds = value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(TransportKind::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    if kinds.is_empty() {
        return Err("transport list is empty".to_string());
    }
    Ok(kinds)
}
