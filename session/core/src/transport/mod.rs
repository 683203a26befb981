//! Real-time Transport Layer
//!
//! Provides abstraction over the backend's real-time channel:
//! - `SocketIoClient`: Socket.IO v5 over WebSocket or HTTP long-polling
//! - `InProcessTransport`: channel pair for embedded peers and tests
//!
//! # Design Philosophy
//!
//! The session controller only sees [`RealtimeTransport`] and
//! [`TransportEvent`]. Negotiation, heartbeats and reconnection stay inside
//! the transport, so the controller's reducer never touches sockets.

pub mod config;
pub mod engine_io;
pub mod factory;
pub mod in_process;
pub mod polling;
pub mod socket_io;
pub mod traits;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-exports for convenience
pub use config::{TransportConfig, TransportKind};
pub use engine_io::{EnginePacket, OpenHandshake, SocketPacket};
pub use factory::{create_realtime_transport, SocketIoConnector};
pub use in_process::{InProcessConnector, InProcessPeer, InProcessTransport};
pub use socket_io::SocketIoClient;
pub use traits::{RealtimeTransport, TransportConnector, TransportError, TransportEvent};
