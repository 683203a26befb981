//! Socket.IO Client Transport
//!
//! Speaks Socket.IO v5 over Engine.IO v4 to the backend's real-time endpoint.
//!
//! A supervisor task owns the live engine link. It negotiates a transport in
//! the configured order (WebSocket first, then long-polling), performs the
//! namespace handshake, answers heartbeats, forwards named events and
//! reconnects with a fixed delay up to the configured number of attempts.
//!
//! ```text
//! SocketIoClient ── outgoing mpsc ──> supervisor ──> EngineLink (ws | polling)
//!       ^                                 │
//!       └──────── TransportEvent mpsc ────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::{IncomingEvent, OutgoingEvent};

use super::config::{TransportConfig, TransportKind};
use super::engine_io::{EnginePacket, OpenHandshake, SocketPacket};
use super::polling::PollingLink;
use super::traits::{RealtimeTransport, TransportError, TransportEvent};
#[cfg(feature = "websocket")]
use super::websocket::WebSocketLink;

/// Channel capacity for events and emits
const CHANNEL_CAPACITY: usize = 100;

/// Reason reported when the server closes the namespace
pub const SERVER_DISCONNECT_REASON: &str = "io server disconnect";

/// One negotiated Engine.IO session
#[async_trait]
pub trait EngineLink: Send {
    /// Send one packet
    async fn send(&mut self, packet: EnginePacket) -> Result<(), TransportError>;

    /// Receive the next packet; `None` once the link is gone
    async fn recv(&mut self) -> Option<Result<EnginePacket, TransportError>>;

    /// Close the session
    async fn close(&mut self);

    /// Which transport this link uses
    fn kind(&self) -> TransportKind;
}

/// How a live link ended
#[derive(Debug)]
enum LinkEnd {
    /// The client asked to shut down
    Shutdown,
    /// The server closed the namespace; no reconnection
    ServerDisconnect,
    /// The link dropped
    Lost(String),
}

/// Socket.IO client implementing [`RealtimeTransport`]
pub struct SocketIoClient {
    config: TransportConfig,
    http: reqwest::Client,
    cookies: Option<Arc<Jar>>,
    outgoing_tx: Option<mpsc::Sender<OutgoingEvent>>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl SocketIoClient {
    /// Create a client
    ///
    /// When `with_credentials` is set, `cookies` is attached to the polling
    /// requests and to the WebSocket upgrade.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: TransportConfig, cookies: Option<Arc<Jar>>) -> Result<Self, TransportError> {
        let cookies = cookies.filter(|_| config.with_credentials);
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(jar) = &cookies {
            builder = builder.cookie_provider(Arc::clone(jar));
        }
        let http = builder
            .build()
            .map_err(|e| TransportError::ConnectionFailed(format!("HTTP client: {e}")))?;

        Ok(Self {
            config,
            http,
            cookies,
            outgoing_tx: None,
            event_rx: None,
            connected: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            supervisor: None,
        })
    }

    /// Transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl RealtimeTransport for SocketIoClient {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.supervisor.is_some() {
            return Err(TransportError::InvalidState(
                "Already connected".to_string(),
            ));
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let supervisor = Supervisor {
            config: self.config.clone(),
            http: self.http.clone(),
            cookies: self.cookies.clone(),
            events: event_tx,
            connected: Arc::clone(&self.connected),
            closed: Arc::clone(&self.closed),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run(outgoing_rx)));
        self.outgoing_tx = Some(outgoing_tx);
        self.event_rx = Some(event_rx);

        tracing::info!(url = %self.config.url, "Connecting to real-time endpoint");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender tells the supervisor to close the link.
        self.outgoing_tx = None;
        tracing::info!("Disconnected from real-time endpoint");
        Ok(())
    }

    async fn emit(&self, event: OutgoingEvent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("Not connected".to_string()));
        }

        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(event)
                .await
                .map_err(|_| TransportError::SendFailed("Channel closed".to_string())),
            None => Err(TransportError::InvalidState("Not connected".to_string())),
        }
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.event_rx.as_mut()?.recv().await
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        self.event_rx.as_mut()?.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Background task owning the engine link
struct Supervisor {
    config: TransportConfig,
    http: reqwest::Client,
    cookies: Option<Arc<Jar>>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(self, mut outgoing: mpsc::Receiver<OutgoingEvent>) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut attempt: u32 = 0;

        loop {
            match self.establish().await {
                Ok((mut link, open)) => {
                    attempt = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!(transport = %link.kind(), sid = %open.sid, "Real-time channel connected");
                    if !self.report(TransportEvent::Connected).await {
                        link.close().await;
                        break;
                    }

                    let end = self.pump(link.as_mut(), &open, &mut outgoing).await;
                    self.connected.store(false, Ordering::SeqCst);
                    match end {
                        LinkEnd::Shutdown => {
                            link.close().await;
                            break;
                        }
                        LinkEnd::ServerDisconnect => {
                            tracing::info!("Server closed the namespace");
                            self.report(TransportEvent::Disconnected(
                                SERVER_DISCONNECT_REASON.to_string(),
                            ))
                            .await;
                            break;
                        }
                        LinkEnd::Lost(reason) => {
                            tracing::warn!(reason = %reason, "Real-time channel lost");
                            if !self
                                .report(TransportEvent::Disconnected(reason))
                                .await
                            {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "Real-time connection failed");
                    if !self.report(TransportEvent::ConnectError(e.to_string())).await {
                        break;
                    }
                }
            }

            if !self.config.reconnection || attempt >= self.config.reconnect_attempts {
                tracing::warn!(
                    attempts = attempt,
                    "Giving up on real-time channel"
                );
                break;
            }
            attempt += 1;

            // Fixed reconnect delay; a closed emit channel cancels the wait.
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                pending = outgoing.recv() => match pending {
                    Some(event) => {
                        tracing::warn!(event = event.name(), "Dropping emit while reconnecting");
                    }
                    None => break,
                },
            }
            tracing::info!(attempt, max = self.config.reconnect_attempts, "Reconnecting");
        }

        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Forward an event; false when the client is gone
    async fn report(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn establish(&self) -> Result<(Box<dyn EngineLink>, OpenHandshake), TransportError> {
        let mut failures = Vec::new();
        for kind in &self.config.transports {
            let link = match self.open_link(*kind).await {
                Ok(link) => link,
                Err(e) => {
                    tracing::debug!(transport = %kind, error = %e, "Transport unavailable");
                    failures.push(format!("{kind}: {e}"));
                    continue;
                }
            };
            match self.handshake(link).await {
                Ok(established) => return Ok(established),
                Err(e) => {
                    tracing::debug!(transport = %kind, error = %e, "Handshake failed");
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }
        Err(TransportError::NoTransport(failures.join("; ")))
    }

    async fn open_link(&self, kind: TransportKind) -> Result<Box<dyn EngineLink>, TransportError> {
        match kind {
            TransportKind::WebSocket => self.open_websocket().await,
            TransportKind::Polling => {
                let link = PollingLink::open(&self.config, self.http.clone()).await?;
                Ok(Box::new(link))
            }
        }
    }

    #[cfg(feature = "websocket")]
    async fn open_websocket(&self) -> Result<Box<dyn EngineLink>, TransportError> {
        let url = self.config.endpoint(TransportKind::WebSocket, None)?;
        let cookie = self.cookie_header();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let link = WebSocketLink::open(&url, cookie.as_deref(), timeout).await?;
        Ok(Box::new(link))
    }

    #[cfg(not(feature = "websocket"))]
    async fn open_websocket(&self) -> Result<Box<dyn EngineLink>, TransportError> {
        Err(TransportError::NoTransport(
            "built without websocket support".to_string(),
        ))
    }

    /// Cookies stored for the backend origin
    #[cfg_attr(not(feature = "websocket"), allow(dead_code))]
    fn cookie_header(&self) -> Option<String> {
        let jar = self.cookies.as_ref()?;
        let origin = Url::parse(&self.config.url).ok()?;
        jar.cookies(&origin)
            .and_then(|value| value.to_str().ok().map(ToString::to_string))
    }

    /// Wait for the open packet and complete the namespace connect
    async fn handshake(
        &self,
        mut link: Box<dyn EngineLink>,
    ) -> Result<(Box<dyn EngineLink>, OpenHandshake), TransportError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let result = tokio::time::timeout(timeout, namespace_connect(link.as_mut())).await;
        match result {
            Ok(Ok(open)) => Ok((link, open)),
            Ok(Err(e)) => {
                link.close().await;
                Err(e)
            }
            Err(_) => {
                link.close().await;
                Err(TransportError::ConnectionFailed(format!(
                    "handshake timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn pump(
        &self,
        link: &mut dyn EngineLink,
        open: &OpenHandshake,
        outgoing: &mut mpsc::Receiver<OutgoingEvent>,
    ) -> LinkEnd {
        let ping_window = Duration::from_millis(open.ping_interval + open.ping_timeout);
        let mut ping_deadline = Instant::now() + ping_window;

        loop {
            tokio::select! {
                packet = link.recv() => match packet {
                    Some(Ok(EnginePacket::Ping(data))) => {
                        ping_deadline = Instant::now() + ping_window;
                        if let Err(e) = link.send(EnginePacket::Pong(data)).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                    Some(Ok(EnginePacket::Message(text))) => {
                        if let Some(end) = self.dispatch(&text).await {
                            return end;
                        }
                    }
                    Some(Ok(EnginePacket::Close)) | None => {
                        return LinkEnd::Lost("transport close".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                },
                event = outgoing.recv() => match event {
                    Some(event) => {
                        let packet = SocketPacket::event(event.name(), event.payload());
                        tracing::debug!(event = event.name(), "Emitting");
                        if let Err(e) = link.send(EnginePacket::Message(packet.encode())).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                    None => return LinkEnd::Shutdown,
                },
                () = tokio::time::sleep_until(ping_deadline) => {
                    return LinkEnd::Lost("ping timeout".to_string());
                }
            }
        }
    }

    /// Handle one Socket.IO packet; returns how the link ended, if it did
    async fn dispatch(&self, text: &str) -> Option<LinkEnd> {
        match SocketPacket::decode(text) {
            Ok(SocketPacket::Event { name, data, .. }) => match IncomingEvent::decode(&name, data) {
                Ok(event) => {
                    if !self.report(TransportEvent::Incoming(event)).await {
                        return Some(LinkEnd::Shutdown);
                    }
                }
                Err(e) => tracing::warn!(event = %name, error = %e, "Dropping undecodable event"),
            },
            Ok(SocketPacket::Disconnect) => return Some(LinkEnd::ServerDisconnect),
            Ok(other) => tracing::debug!(packet = ?other, "Ignoring socket packet"),
            Err(e) => tracing::warn!(error = %e, "Invalid socket packet"),
        }
        None
    }
}

/// Read the open packet, send the namespace connect and wait for the reply
async fn namespace_connect(link: &mut dyn EngineLink) -> Result<OpenHandshake, TransportError> {
    let open = loop {
        match link.recv().await {
            Some(Ok(EnginePacket::Open(handshake))) => break handshake,
            Some(Ok(EnginePacket::Noop)) => {}
            Some(Ok(other)) => {
                return Err(TransportError::Protocol(format!(
                    "expected open packet, got {other:?}"
                )))
            }
            Some(Err(e)) => return Err(e),
            None => return Err(TransportError::ConnectionClosed),
        }
    };

    link.send(EnginePacket::Message(SocketPacket::Connect(None).encode()))
        .await?;

    loop {
        match link.recv().await {
            Some(Ok(EnginePacket::Message(text))) => match SocketPacket::decode(&text)? {
                SocketPacket::Connect(_) => return Ok(open),
                SocketPacket::ConnectError(data) => {
                    return Err(TransportError::ConnectionFailed(
                        SocketPacket::connect_error_message(&data),
                    ))
                }
                other => tracing::debug!(packet = ?other, "Ignoring packet before namespace connect"),
            },
            Some(Ok(EnginePacket::Ping(data))) => link.send(EnginePacket::Pong(data)).await?,
            Some(Ok(EnginePacket::Close)) | None => return Err(TransportError::ConnectionClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::events::MessageChunk;

    /// Scripted link: yields queued packets, records sends
    struct ScriptedLink {
        inbound: VecDeque<EnginePacket>,
        sent: Arc<parking_lot::Mutex<Vec<EnginePacket>>>,
    }

    #[async_trait]
    impl EngineLink for ScriptedLink {
        async fn send(&mut self, packet: EnginePacket) -> Result<(), TransportError> {
            self.sent.lock().push(packet);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<EnginePacket, TransportError>> {
            match self.inbound.pop_front() {
                Some(packet) => Some(Ok(packet)),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}

        fn kind(&self) -> TransportKind {
            TransportKind::Polling
        }
    }

    fn handshake() -> OpenHandshake {
        OpenHandshake {
            sid: "sid-1".into(),
            upgrades: Vec::new(),
            ping_interval: 25_000,
            ping_timeout: 20_000,
            max_payload: None,
        }
    }

    fn open_packet() -> EnginePacket {
        EnginePacket::Open(handshake())
    }

    fn scripted(inbound: Vec<EnginePacket>) -> (ScriptedLink, Arc<parking_lot::Mutex<Vec<EnginePacket>>>) {
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        (
            ScriptedLink {
                inbound: inbound.into(),
                sent: Arc::clone(&sent),
            },
            sent,
        )
    }

    fn supervisor() -> (Supervisor, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(16);
        let supervisor = Supervisor {
            config: TransportConfig::default(),
            http: reqwest::Client::new(),
            cookies: None,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (supervisor, rx)
    }

    #[tokio::test]
    async fn test_namespace_connect_success() {
        let (mut link, sent) = scripted(vec![
            open_packet(),
            EnginePacket::Message(r#"0{"sid":"ns-1"}"#.into()),
        ]);
        let open = namespace_connect(&mut link).await.unwrap();
        assert_eq!(open.sid, "sid-1");
        assert_eq!(sent.lock().as_slice(), &[EnginePacket::Message("0".into())]);
    }

    #[tokio::test]
    async fn test_namespace_connect_refused() {
        let (mut link, _sent) = scripted(vec![
            open_packet(),
            EnginePacket::Message(r#"4{"message":"Not authorized"}"#.into()),
        ]);
        let err = namespace_connect(&mut link).await.unwrap_err();
        assert!(err.to_string().contains("Not authorized"));
    }

    #[tokio::test]
    async fn test_namespace_connect_requires_open() {
        let (mut link, _sent) = scripted(vec![EnginePacket::Message("0".into())]);
        assert!(matches!(
            namespace_connect(&mut link).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_pump_answers_ping_and_forwards_events() {
        let (supervisor, mut events) = supervisor();
        let (mut link, sent) = scripted(vec![
            EnginePacket::Ping(String::new()),
            EnginePacket::Message(r#"2["ai_message_chunk",{"conversation_id":1,"content":"Hi"}]"#.into()),
            EnginePacket::Message("1".into()),
        ]);
        let open = handshake();
        let (_tx, mut outgoing) = mpsc::channel(4);

        let end = supervisor.pump(&mut link, &open, &mut outgoing).await;
        assert!(matches!(end, LinkEnd::ServerDisconnect));
        assert_eq!(sent.lock().first(), Some(&EnginePacket::Pong(String::new())));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Incoming(IncomingEvent::MessageChunk(MessageChunk {
                conversation_id: Some(crate::messages::ConversationId::Numeric(1)),
                content: "Hi".into(),
            })))
        );
    }

    #[tokio::test]
    async fn test_pump_emits_outgoing_and_stops_on_shutdown() {
        let (supervisor, _events) = supervisor();
        let (mut link, sent) = scripted(Vec::new());
        let open = handshake();
        let (tx, mut outgoing) = mpsc::channel(4);
        tx.send(OutgoingEvent::GuestNewConversation).await.unwrap();
        drop(tx);

        let end = supervisor.pump(&mut link, &open, &mut outgoing).await;
        assert!(matches!(end, LinkEnd::Shutdown));
        assert_eq!(
            sent.lock().as_slice(),
            &[EnginePacket::Message(r#"2["guest_new_conversation"]"#.into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_ping_timeout() {
        let (supervisor, _events) = supervisor();
        let (mut link, _sent) = scripted(Vec::new());
        let open = handshake();
        let (_tx, mut outgoing) = mpsc::channel::<OutgoingEvent>(4);

        let end = supervisor.pump(&mut link, &open, &mut outgoing).await;
        assert!(matches!(end, LinkEnd::Lost(reason) if reason == "ping timeout"));
    }
}
