//! Transport Traits
//!
//! The session talks to the backend's real-time channel through
//! [`RealtimeTransport`]. A [`TransportConnector`] builds a fresh transport
//! each time the connection policy decides a connection should exist.

use std::fmt;

use async_trait::async_trait;

use crate::events::{IncomingEvent, OutgoingEvent};

/// Errors that can occur during transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Connection to the backend failed
    ConnectionFailed(String),
    /// Connection was closed
    ConnectionClosed,
    /// Failed to send a packet
    SendFailed(String),
    /// The peer sent something that is not valid Engine.IO / Socket.IO
    Protocol(String),
    /// Payload serialization/deserialization error
    SerializationError(String),
    /// Every configured transport kind failed or is unavailable
    NoTransport(String),
    /// IO error from the underlying transport
    IoError(std::io::Error),
    /// Transport not in expected state
    InvalidState(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            Self::NoTransport(msg) => write!(f, "No usable transport: {msg}"),
            Self::IoError(e) => write!(f, "IO error: {e}"),
            Self::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// What a transport reports to the session
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The channel is connected and the namespace handshake completed
    Connected,
    /// A connection attempt failed
    ConnectError(String),
    /// An established connection was lost
    Disconnected(String),
    /// A named event from the server
    Incoming(IncomingEvent),
}

/// Client side of the real-time channel
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Start connecting
    ///
    /// Returns once connection work has started; the outcome arrives as
    /// [`TransportEvent::Connected`] or [`TransportEvent::ConnectError`].
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the channel and stop reconnecting
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Emit a named event
    async fn emit(&self, event: OutgoingEvent) -> Result<(), TransportError>;

    /// Receive the next transport event
    ///
    /// Returns `None` once the transport has shut down for good.
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Receive an event if one is ready
    fn try_recv(&mut self) -> Option<TransportEvent>;

    /// Whether the channel is currently connected
    fn is_connected(&self) -> bool;

    /// Whether the transport has shut down and will not reconnect
    fn is_closed(&self) -> bool;
}

/// Factory for transports
pub trait TransportConnector: Send + Sync {
    /// Build a new, not yet connected transport
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be constructed.
    fn create(&self) -> Result<Box<dyn RealtimeTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = TransportError::from(io_err);
        assert!(err.to_string().contains("IO error"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_transport_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = TransportError::from(json_err);
        assert!(matches!(err, TransportError::SerializationError(_)));
    }
}
