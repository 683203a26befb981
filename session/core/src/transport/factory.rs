//! Transport Factory
//!
//! Builds the real-time transport used by the connection manager. The
//! connector keeps the shared cookie jar so every new connection presents the
//! same credentials as the REST client.

use std::sync::Arc;

use reqwest::cookie::Jar;

use super::config::TransportConfig;
use super::socket_io::SocketIoClient;
use super::traits::{RealtimeTransport, TransportConnector, TransportError};

/// Create a Socket.IO transport for the given configuration
///
/// # Errors
///
/// Returns an error if the underlying HTTP client cannot be built.
///
/// # Example
///
/// ```ignore
/// let mut transport = create_realtime_transport(&config, Some(api.cookie_jar()))?;
/// transport.connect().await?;
/// ```
pub fn create_realtime_transport(
    config: &TransportConfig,
    cookies: Option<Arc<Jar>>,
) -> Result<Box<dyn RealtimeTransport>, TransportError> {
    let client = SocketIoClient::new(config.clone(), cookies)?;
    Ok(Box::new(client))
}

/// Connector producing Socket.IO transports
#[derive(Clone)]
pub struct SocketIoConnector {
    config: TransportConfig,
    cookies: Option<Arc<Jar>>,
}

impl SocketIoConnector {
    /// Create a connector sharing `cookies` with the REST client
    #[must_use]
    pub fn new(config: TransportConfig, cookies: Option<Arc<Jar>>) -> Self {
        Self { config, cookies }
    }

    /// Transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl TransportConnector for SocketIoConnector {
    fn create(&self) -> Result<Box<dyn RealtimeTransport>, TransportError> {
        create_realtime_transport(&self.config, self.cookies.clone())
    }
}
