//! In-Process Transport
//!
//! Channel-backed transport for running a session against an in-process peer
//! instead of a real backend. Tests and embedded surfaces drive the peer side.
//!
//! # Usage
//!
//! ```ignore
//! let (connector, mut peers) = InProcessConnector::new();
//! let mut manager = ConnectionManager::new(connector);
//! manager.update(inputs).await?;
//!
//! let mut peer = peers.try_recv()?;
//! peer.push(IncomingEvent::MessageChunk(chunk)).await;
//! let emitted = peer.emitted.try_recv()?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::{IncomingEvent, OutgoingEvent};

use super::traits::{RealtimeTransport, TransportConnector, TransportError, TransportEvent};

/// Channel capacity for each direction
const CHANNEL_CAPACITY: usize = 100;

/// Session side of an in-process channel
pub struct InProcessTransport {
    /// Events emitted by the session
    emit_tx: mpsc::Sender<OutgoingEvent>,
    /// Events pushed by the peer
    event_rx: mpsc::Receiver<TransportEvent>,
    /// Loopback used to announce our own connection
    loopback_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

/// Peer side of an in-process channel
pub struct InProcessPeer {
    /// Events emitted by the session
    pub emitted: mpsc::Receiver<OutgoingEvent>,
    /// Push transport events to the session
    pub events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl InProcessTransport {
    /// Create a connected transport/peer pair
    #[must_use]
    pub fn new_pair() -> (Self, InProcessPeer) {
        let (emit_tx, emit_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Self {
            emit_tx,
            event_rx,
            loopback_tx: event_tx.clone(),
            connected: Arc::clone(&connected),
            closed: Arc::clone(&closed),
        };
        let peer = InProcessPeer {
            emitted: emit_rx,
            events: event_tx,
            connected,
            closed,
        };
        (transport, peer)
    }
}

impl InProcessPeer {
    /// Push a server event to the session
    pub async fn push(&self, event: IncomingEvent) {
        if self.events.send(TransportEvent::Incoming(event)).await.is_err() {
            tracing::warn!("In-process transport dropped; event discarded");
        }
    }

    /// Simulate the server dropping the connection
    pub async fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(TransportEvent::Disconnected(reason.to_string()))
            .await;
    }

    /// Whether the session side currently considers itself connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the session side has been shut down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeTransport for InProcessTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState(
                "Transport already closed".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.loopback_tx
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn emit(&self, event: OutgoingEvent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState(
                "Transport not connected".to_string(),
            ));
        }

        self.emit_tx
            .send(event)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.event_rx.recv().await
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        self.event_rx.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector that hands the peer side of every new transport to the caller
pub struct InProcessConnector {
    peers: mpsc::UnboundedSender<InProcessPeer>,
}

impl InProcessConnector {
    /// Create a connector and the receiver that yields one peer per transport
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InProcessPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        (Self { peers }, peer_rx)
    }
}

impl TransportConnector for InProcessConnector {
    fn create(&self) -> Result<Box<dyn RealtimeTransport>, TransportError> {
        let (transport, peer) = InProcessTransport::new_pair();
        self.peers
            .send(peer)
            .map_err(|_| TransportError::InvalidState("Peer receiver dropped".to_string()))?;
        Ok(Box::new(transport))
    }
}
