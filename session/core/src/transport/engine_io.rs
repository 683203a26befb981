//! Engine.IO / Socket.IO Packet Codec
//!
//! Text encoding of the two protocol layers carried by the real-time channel.
//!
//! # Engine.IO v4 packets
//!
//! ```text
//! +------+------------------------------------------+
//! | Type | Data                                     |
//! +------+------------------------------------------+
//! | 0    | open: {"sid", "pingInterval", ...}       |
//! | 1    | close                                    |
//! | 2    | ping (server -> client)                  |
//! | 3    | pong (client -> server)                  |
//! | 4    | message: a Socket.IO packet              |
//! | 5    | upgrade                                  |
//! | 6    | noop                                     |
//! +------+------------------------------------------+
//! ```
//!
//! A polling payload concatenates packets with the record separator `0x1e`.
//!
//! # Socket.IO v5 packets (inside an Engine.IO message)
//!
//! ```text
//! <type>[<namespace>,][<ack id>][<json>]
//!
//! 0  connect          40  /  40{"sid":"..."}
//! 1  disconnect       41
//! 2  event            42["ai_message_chunk",{...}]
//! 3  ack
//! 4  connect error    44{"message":"..."}
//! ```
//!
//! Binary attachments (types 5 and 6) are not used by this backend and are
//! rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::TransportError;

/// Maximum accepted packet payload (1 MB, the Engine.IO default)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Separator between packets in a polling payload
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Handshake data sent with the Engine.IO open packet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine.IO session id
    pub sid: String,
    /// Transports the session may upgrade to
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Server ping interval in milliseconds
    pub ping_interval: u64,
    /// Time the server waits for a pong in milliseconds
    pub ping_timeout: u64,
    /// Largest payload the server accepts
    #[serde(default)]
    pub max_payload: Option<u64>,
}

/// One Engine.IO packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnginePacket {
    /// Session opened
    Open(OpenHandshake),
    /// Session closed
    Close,
    /// Heartbeat probe, optionally carrying data
    Ping(String),
    /// Heartbeat reply
    Pong(String),
    /// Application data (a Socket.IO packet)
    Message(String),
    /// Transport upgrade
    Upgrade,
    /// No-op
    Noop,
}

impl EnginePacket {
    /// Encode to text
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => {
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }

    /// Decode one packet from text
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Protocol` for empty, oversized, binary or
    /// unknown packets, and for a malformed open handshake.
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        if text.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Protocol(format!(
                "packet of {} bytes exceeds maximum {MAX_PAYLOAD_SIZE}",
                text.len()
            )));
        }
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| TransportError::Protocol("empty packet".to_string()))?;
        let data = chars.as_str();

        match kind {
            '0' => {
                let handshake = serde_json::from_str(data).map_err(|e| {
                    TransportError::Protocol(format!("invalid open handshake: {e}"))
                })?;
                Ok(Self::Open(handshake))
            }
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(data.to_string())),
            '3' => Ok(Self::Pong(data.to_string())),
            '4' => Ok(Self::Message(data.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            'b' => Err(TransportError::Protocol(
                "binary packets are not supported".to_string(),
            )),
            other => Err(TransportError::Protocol(format!(
                "unknown engine packet type `{other}`"
            ))),
        }
    }
}

/// Decode a polling payload into packets
///
/// # Errors
///
/// Fails on the first packet that does not decode.
pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>, TransportError> {
    body.split(RECORD_SEPARATOR)
        .filter(|part| !part.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

/// Encode packets into a polling payload
#[must_use]
pub fn encode_payload(packets: &[EnginePacket]) -> String {
    packets
        .iter()
        .map(EnginePacket::encode)
        .collect::<Vec<_>>()
        .join(&RECORD_SEPARATOR.to_string())
}

/// One Socket.IO packet on the default namespace
#[derive(Clone, Debug, PartialEq)]
pub enum SocketPacket {
    /// Namespace connect request (client) or acknowledgement (server)
    Connect(Option<Value>),
    /// Namespace disconnect
    Disconnect,
    /// Named event with optional payload
    Event {
        /// Event name
        name: String,
        /// First argument after the name
        data: Option<Value>,
        /// Acknowledgement id requested by the sender
        ack_id: Option<u64>,
    },
    /// Acknowledgement of an event
    Ack {
        /// Acknowledged id
        ack_id: u64,
        /// Acknowledgement arguments
        data: Value,
    },
    /// Namespace connection refused
    ConnectError(Value),
}

impl SocketPacket {
    /// Build an event packet
    #[must_use]
    pub fn event(name: impl Into<String>, data: Option<Value>) -> Self {
        Self::Event {
            name: name.into(),
            data,
            ack_id: None,
        }
    }

    /// Encode to text (without the Engine.IO message prefix)
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Connect(None) => "0".to_string(),
            Self::Connect(Some(auth)) => format!("0{auth}"),
            Self::Disconnect => "1".to_string(),
            Self::Event { name, data, ack_id } => {
                let mut args = vec![Value::String(name.clone())];
                if let Some(data) = data {
                    args.push(data.clone());
                }
                let ack = ack_id.map(|id| id.to_string()).unwrap_or_default();
                format!("2{ack}{}", Value::Array(args))
            }
            Self::Ack { ack_id, data } => format!("3{ack_id}{data}"),
            Self::ConnectError(data) => format!("4{data}"),
        }
    }

    /// Decode from the data of an Engine.IO message packet
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Protocol` for unknown or binary packet types,
    /// a non-default namespace, or malformed JSON.
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| TransportError::Protocol("empty socket packet".to_string()))?;
        let mut rest = chars.as_str();

        if rest.starts_with('/') {
            let (namespace, tail) = rest.split_once(',').unwrap_or((rest, ""));
            if namespace != "/" {
                return Err(TransportError::Protocol(format!(
                    "unexpected namespace `{namespace}`"
                )));
            }
            rest = tail;
        }

        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            rest[..digits].parse::<u64>().ok()
        } else {
            None
        };
        let body = &rest[digits..];
        let json = if body.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(body).map_err(|e| {
                TransportError::Protocol(format!("invalid socket packet body: {e}"))
            })?)
        };

        match kind {
            '0' => Ok(Self::Connect(json)),
            '1' => Ok(Self::Disconnect),
            '2' => {
                let Some(Value::Array(mut args)) = json else {
                    return Err(TransportError::Protocol(
                        "event packet without argument array".to_string(),
                    ));
                };
                if args.is_empty() {
                    return Err(TransportError::Protocol("event without name".to_string()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(TransportError::Protocol(format!(
                            "event name is not a string: {other}"
                        )))
                    }
                };
                let data = if args.is_empty() {
                    None
                } else {
                    Some(args.remove(0))
                };
                Ok(Self::Event { name, data, ack_id })
            }
            '3' => Ok(Self::Ack {
                ack_id: ack_id.unwrap_or_default(),
                data: json.unwrap_or(Value::Null),
            }),
            '4' => Ok(Self::ConnectError(json.unwrap_or(Value::Null))),
            '5' | '6' => Err(TransportError::Protocol(
                "binary socket packets are not supported".to_string(),
            )),
            other => Err(TransportError::Protocol(format!(
                "unknown socket packet type `{other}`"
            ))),
        }
    }

    /// Message carried by a connect-error packet
    #[must_use]
    pub fn connect_error_message(data: &Value) -> String {
        match data {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("connection refused")
                .to_string(),
            _ => "connection refused".to_string(),
        }
    }
}
