//! Long-Polling Engine Link
//!
//! Engine.IO over HTTP. The handshake `GET` returns the open packet; after
//! that a background task keeps one `GET` outstanding and forwards every
//! packet it receives, while sends are individual `POST`s.
//!
//! Cookies ride on the shared `reqwest` client, so the same credentials reach
//! both this link and the REST API.

use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::{TransportConfig, TransportKind};
use super::engine_io::{decode_payload, EnginePacket};
use super::socket_io::EngineLink;
use super::traits::TransportError;

/// Buffered packets between the poll task and the reader
const POLL_BUFFER: usize = 64;

/// Engine.IO session over HTTP long-polling
pub struct PollingLink {
    http: reqwest::Client,
    endpoint: Url,
    incoming: mpsc::Receiver<Result<EnginePacket, TransportError>>,
    poller: JoinHandle<()>,
}

impl PollingLink {
    /// Perform the polling handshake and start the poll loop
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake request fails or the first packet is
    /// not an open packet.
    pub async fn open(config: &TransportConfig, http: reqwest::Client) -> Result<Self, TransportError> {
        let handshake_url = config.endpoint(TransportKind::Polling, None)?;
        let body = fetch(&http, &handshake_url).await?;
        let packets = decode_payload(&body)?;

        let sid = match packets.first() {
            Some(EnginePacket::Open(handshake)) => handshake.sid.clone(),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected open packet, got {other:?}"
                )))
            }
        };
        let endpoint = config.endpoint(TransportKind::Polling, Some(&sid))?;

        let (tx, incoming) = mpsc::channel(POLL_BUFFER);
        for packet in packets {
            if tx.send(Ok(packet)).await.is_err() {
                break;
            }
        }

        let poller = tokio::spawn(poll_loop(http.clone(), endpoint.clone(), tx));
        tracing::debug!(sid = %sid, "Polling session opened");

        Ok(Self {
            http,
            endpoint,
            incoming,
            poller,
        })
    }
}

async fn fetch(http: &reqwest::Client, url: &Url) -> Result<String, TransportError> {
    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::ConnectionFailed(format!(
            "poll returned HTTP {status}"
        )));
    }
    response
        .text()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
}

async fn poll_loop(
    http: reqwest::Client,
    endpoint: Url,
    tx: mpsc::Sender<Result<EnginePacket, TransportError>>,
) {
    loop {
        let result = match fetch(&http, &endpoint).await {
            Ok(body) => decode_payload(&body),
            Err(e) => Err(e),
        };
        match result {
            Ok(packets) => {
                let closed = packets.iter().any(|p| matches!(p, EnginePacket::Close));
                for packet in packets {
                    if tx.send(Ok(packet)).await.is_err() {
                        return;
                    }
                }
                if closed {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Poll request failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

#[async_trait]
impl EngineLink for PollingLink {
    async fn send(&mut self, packet: EnginePacket) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(packet.encode())
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::SendFailed(format!(
                "post returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<EnginePacket, TransportError>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.send(EnginePacket::Close).await {
            tracing::debug!(error = %e, "Failed to send close packet");
        }
        self.poller.abort();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }
}

impl Drop for PollingLink {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
