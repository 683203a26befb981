//! Connection Manager
//!
//! Owns the single real-time connection of a session. Whether a connection
//! should exist is a pure function of three inputs; the manager opens or tears
//! down the transport only when that answer flips.
//!
//! ```text
//!   authenticated ─┐
//!   guest_mode ────┼─ should_connect ──► open / close / unchanged
//!   local_guest ───┘
//! ```

use crate::events::OutgoingEvent;
use crate::transport::{RealtimeTransport, TransportConnector, TransportError, TransportEvent};

/// Inputs that decide whether a connection should exist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInputs {
    /// A backend session cookie is valid
    pub authenticated: bool,
    /// Guest mode chosen in this run
    pub guest_mode: bool,
    /// Guest flag persisted from an earlier run
    pub local_guest: bool,
}

impl ConnectionInputs {
    /// Whether the policy wants a live connection
    #[must_use]
    pub fn should_connect(self) -> bool {
        self.authenticated || self.guest_mode || self.local_guest
    }
}

/// What an evaluation did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionChange {
    /// A new transport was created and asked to connect
    Opened,
    /// The live transport was torn down
    Closed,
    /// Nothing changed
    Unchanged,
}

/// Opens and closes the real-time transport following [`ConnectionInputs`]
pub struct ConnectionManager<C: TransportConnector> {
    connector: C,
    transport: Option<Box<dyn RealtimeTransport>>,
    inputs: ConnectionInputs,
}

impl<C: TransportConnector> ConnectionManager<C> {
    /// Create a manager with no connection
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            transport: None,
            inputs: ConnectionInputs::default(),
        }
    }

    /// Last inputs seen
    #[must_use]
    pub fn inputs(&self) -> ConnectionInputs {
        self.inputs
    }

    /// Whether a transport exists and has not shut down
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    /// Whether the live transport has completed its handshake
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// Record new inputs and re-evaluate
    ///
    /// # Errors
    ///
    /// Returns an error if a transport cannot be created or started.
    pub async fn update(
        &mut self,
        inputs: ConnectionInputs,
    ) -> Result<ConnectionChange, TransportError> {
        self.inputs = inputs;
        self.evaluate().await
    }

    /// Open or close the transport if the policy output differs from reality
    ///
    /// # Errors
    ///
    /// Returns an error if a transport cannot be created or started.
    pub async fn evaluate(&mut self) -> Result<ConnectionChange, TransportError> {
        let wanted = self.inputs.should_connect();
        match (wanted, self.is_live()) {
            (true, true) | (false, false) => {
                if !wanted {
                    self.transport = None;
                }
                Ok(ConnectionChange::Unchanged)
            }
            (true, false) => {
                let mut transport = self.connector.create()?;
                transport.connect().await?;
                tracing::info!(inputs = ?self.inputs, "Opening real-time connection");
                self.transport = Some(transport);
                Ok(ConnectionChange::Opened)
            }
            (false, true) => {
                self.close().await;
                Ok(ConnectionChange::Closed)
            }
        }
    }

    /// Emit an event on the live connection
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NoTransport` without a connection, or the
    /// transport's send error.
    pub async fn emit(&self, event: OutgoingEvent) -> Result<(), TransportError> {
        match self.transport.as_ref() {
            Some(transport) if transport.is_connected() => transport.emit(event).await,
            Some(_) => Err(TransportError::InvalidState(
                "Transport not connected".to_string(),
            )),
            None => Err(TransportError::NoTransport(
                "No live connection".to_string(),
            )),
        }
    }

    /// Next event from the live transport
    ///
    /// Pending forever while there is no transport. A transport that ends its
    /// event stream is dropped and reported as a disconnect.
    pub async fn next_event(&mut self) -> TransportEvent {
        let Some(transport) = self.transport.as_mut() else {
            return std::future::pending().await;
        };
        match transport.recv().await {
            Some(event) => event,
            None => {
                self.transport = None;
                TransportEvent::Disconnected("transport closed".to_string())
            }
        }
    }

    /// Tear down the connection regardless of inputs
    pub async fn shutdown(&mut self) {
        self.close().await;
    }

    async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.disconnect().await {
                tracing::warn!(error = %e, "Failed to disconnect transport");
            }
            tracing::info!("Real-time connection closed");
        }
    }
}
