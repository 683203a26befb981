//! WebSocket Engine Link
//!
//! Engine.IO over a single WebSocket. Each text frame carries exactly one
//! Engine.IO packet.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::config::TransportKind;
use super::engine_io::EnginePacket;
use super::socket_io::EngineLink;
use super::traits::TransportError;

/// Engine.IO session over a WebSocket
pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketLink {
    /// Open the WebSocket, attaching `cookie` to the upgrade request
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` when the handshake fails or
    /// does not finish within `timeout`.
    pub async fn open(
        url: &Url,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if let Some(cookie) = cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| TransportError::ConnectionFailed(format!("invalid cookie: {e}")))?;
            request.headers_mut().insert(header::COOKIE, value);
        }

        let (stream, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "WebSocket handshake timed out after {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::debug!(url = %url, "WebSocket opened");
        Ok(Self { stream })
    }
}

#[async_trait]
impl EngineLink for WebSocketLink {
    async fn send(&mut self, packet: EnginePacket) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(packet.encode()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<EnginePacket, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(EnginePacket::decode(&text)),
                Ok(WsMessage::Close(frame)) => {
                    tracing::debug!(?frame, "WebSocket closed by server");
                    return Some(Ok(EnginePacket::Close));
                }
                Ok(WsMessage::Binary(_)) => {
                    tracing::warn!("Ignoring binary WebSocket frame");
                }
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::ConnectionFailed(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.send(WsMessage::Text(EnginePacket::Close.encode())).await {
            tracing::debug!(error = %e, "Failed to send close packet");
        }
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}
