//! Chat Session Controller
//!
//! The reducer at the heart of a chat session. It owns the [`SessionState`],
//! the [`ConnectionManager`] and the active [`ConversationBackend`], and
//! consumes three inputs in one `select!` loop:
//!
//! - [`SessionCommand`]s from the surface
//! - [`TransportEvent`]s from the real-time channel
//! - the deadline of the outstanding turn
//!
//! Every observable change is published as a [`SessionUpdate`].
//!
//! # Turn lifecycle
//!
//! ```text
//!            send                first chunk              final
//!   Idle ───────────► Sending ─────────────► Streaming ──────────► Idle
//!                       │  │                    │
//!                 stop  │  │ error/disconnect   │ deadline
//!                       ▼  ▼                    ▼
//!                 Cancelled / Errored / TimedOut ─────────────────► Idle
//! ```
//!
//! A cancelled or timed-out turn discards whatever the server still sends
//! for it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::ConversationApi;
use crate::backend::{
    BackendMode, BackendReply, ConversationBackend, RealtimeGuestBackend, RestBackend,
};
use crate::config::SessionConfig;
use crate::connection::{ConnectionChange, ConnectionInputs, ConnectionManager};
use crate::events::{
    ErrorPayload, FinalMessage, GuestConversationData, GuestConversationSummary, IncomingEvent,
    MessageChunk, OutgoingEvent, UserMessagePayload,
};
use crate::messages::{ChatMessage, Conversation, ConversationId, SessionId};
use crate::session::{derive_title, ChunkOutcome, SessionState};
use crate::storage::SessionEnvironment;
use crate::transport::{TransportConnector, TransportEvent};

/// Severity of a notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyLevel {
    /// Informational
    Info,
    /// Something did not work but the session continues
    Warning,
    /// A request failed
    Error,
}

/// Requests from a surface
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a user message
    SendMessage {
        /// Message text
        text: String,
        /// Attachment URLs; only the first is transmitted
        attachments: Vec<String>,
        /// Whether the assistant may generate images
        generate_images: bool,
    },
    /// Clear the view and start over with no active conversation
    StartNewChat,
    /// Show a conversation's history
    LoadConversation {
        /// Conversation to load
        id: ConversationId,
        /// Whether it is a guest conversation
        guest: bool,
    },
    /// Delete a stored conversation
    DeleteConversation(ConversationId),
    /// Rename a conversation
    RenameConversation {
        /// Conversation to rename
        id: ConversationId,
        /// New title
        title: String,
    },
    /// Stop waiting for the current reply
    StopGeneration,
    /// The authentication state changed
    SetAuthenticated(bool),
    /// Guest mode was activated or left
    SetGuestMode(bool),
    /// Reload the conversation list
    RefreshConversations,
    /// Resume the conversation remembered in the location
    RestoreFromLocation,
    /// Replace the input draft
    SetInput(String),
    /// Close the connection and end the session loop
    Shutdown,
}

/// Changes published to surfaces
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A message was appended
    MessageAppended(ChatMessage),
    /// A fragment was added to the streaming reply
    StreamChunk {
        /// The fragment
        content: String,
        /// Whether this fragment started a new streaming reply
        started: bool,
    },
    /// The streaming reply was replaced, or a final reply appended
    ReplyFinalized(ChatMessage),
    /// All visible messages were replaced
    MessagesReplaced(Vec<ChatMessage>),
    /// The loading flag changed
    LoadingChanged(bool),
    /// The active conversation changed
    ConversationChanged(Option<ConversationId>),
    /// The conversation list changed
    ConversationsChanged(Vec<Conversation>),
    /// The guest alias changed
    GuestAliasChanged(String),
    /// The real-time connection came up or went down
    ConnectionChanged(bool),
    /// The input draft was cleared by a send
    InputCleared,
    /// The outstanding turn passed its deadline
    TurnTimedOut,
    /// Something the user should know about
    Notify {
        /// Severity
        level: NotifyLevel,
        /// Text
        message: String,
    },
}

/// Where the outstanding turn is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnPhase {
    /// No turn
    Idle,
    /// Message sent (or queued), no reply yet
    Sending,
    /// Reply is streaming
    Streaming,
}

/// A user message waiting for its guest conversation to exist
#[derive(Clone, Debug)]
struct PendingSend {
    text: String,
    attachments: Vec<String>,
    generate_images: bool,
}

/// One chat session
pub struct ChatSession<A, C>
where
    A: ConversationApi + 'static,
    C: TransportConnector,
{
    id: SessionId,
    config: SessionConfig,
    api: Arc<A>,
    backend: Box<dyn ConversationBackend>,
    connection: ConnectionManager<C>,
    env: SessionEnvironment,
    state: SessionState,
    updates: mpsc::Sender<SessionUpdate>,
    authenticated: bool,
    guest_flag: bool,
    connected: bool,
    cancelled: bool,
    phase: TurnPhase,
    turn_deadline: Option<Instant>,
    pending_send: Option<PendingSend>,
    deferred_restore: Option<ConversationId>,
    input: String,
}

impl<A, C> ChatSession<A, C>
where
    A: ConversationApi + 'static,
    C: TransportConnector,
{
    /// Create a session
    ///
    /// Starts unauthenticated and disconnected. When the location already
    /// names a conversation the session starts loading, waiting for
    /// [`SessionCommand::RestoreFromLocation`].
    pub fn new(
        api: Arc<A>,
        connector: C,
        env: SessionEnvironment,
        config: SessionConfig,
        updates: mpsc::Sender<SessionUpdate>,
    ) -> Self {
        let mut state = SessionState::new(config.titles.clone());
        state.set_loading(env.location.conversation_param().is_some());
        let backend = Self::backend_for(BackendMode::Authenticated, &api, &config);

        Self {
            id: SessionId::new(),
            config,
            api,
            backend,
            connection: ConnectionManager::new(connector),
            env,
            state,
            updates,
            authenticated: false,
            guest_flag: false,
            connected: false,
            cancelled: false,
            phase: TurnPhase::Idle,
            turn_deadline: None,
            pending_send: None,
            deferred_restore: None,
            input: String::new(),
        }
    }

    /// Session id used in logs
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Observable state
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current turn phase
    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Input draft
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Whether the real-time channel is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Mode of the active conversation backend
    #[must_use]
    pub fn backend_mode(&self) -> BackendMode {
        self.backend.mode()
    }

    /// Whether the session talks to the guest backend
    ///
    /// A signed-in user is never a guest, whatever the persisted flag says.
    #[must_use]
    pub fn is_guest_session(&self) -> bool {
        !self.authenticated && (self.guest_flag || self.env.store.is_local_guest())
    }

    /// Run the reducer until [`SessionCommand::Shutdown`] or the command
    /// channel closes
    ///
    /// # Errors
    ///
    /// Returns an error if a handler fails unrecoverably.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) -> anyhow::Result<()> {
        tracing::info!(session_id = %self.id, "Chat session started");

        loop {
            let deadline = self.turn_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await?,
                },
                event = self.connection.next_event() => {
                    self.handle_transport_event(event).await?;
                }
                () = wait_for(deadline) => self.expire_turn().await,
            }
        }

        self.connection.shutdown().await;
        tracing::info!(session_id = %self.id, "Chat session stopped");
        Ok(())
    }

    /// Apply one command
    ///
    /// # Errors
    ///
    /// Returns an error if a handler fails unrecoverably.
    pub async fn handle_command(&mut self, command: SessionCommand) -> anyhow::Result<()> {
        match command {
            SessionCommand::SendMessage {
                text,
                attachments,
                generate_images,
            } => self.send_message(&text, attachments, generate_images).await,
            SessionCommand::StartNewChat => {
                self.start_new_chat().await;
                Ok(())
            }
            SessionCommand::LoadConversation { id, guest } => self.load_conversation(id, guest).await,
            SessionCommand::DeleteConversation(id) => self.delete_conversation(&id).await,
            SessionCommand::RenameConversation { id, title } => {
                self.rename_conversation(&id, &title).await
            }
            SessionCommand::StopGeneration => {
                self.stop_generation().await;
                Ok(())
            }
            SessionCommand::SetAuthenticated(authenticated) => {
                self.set_authenticated(authenticated).await
            }
            SessionCommand::SetGuestMode(enabled) => self.set_guest_mode(enabled).await,
            SessionCommand::RefreshConversations => self.refresh_conversations().await,
            SessionCommand::RestoreFromLocation => self.restore_from_location().await,
            SessionCommand::SetInput(text) => {
                self.input = text;
                Ok(())
            }
            SessionCommand::Shutdown => {
                self.connection.shutdown().await;
                self.set_connected(false).await;
                Ok(())
            }
        }
    }

    /// Wait for the next transport event and apply it
    ///
    /// # Errors
    ///
    /// Returns an error if the handler fails unrecoverably.
    pub async fn poll_transport(&mut self) -> anyhow::Result<()> {
        let event = self.connection.next_event().await;
        self.handle_transport_event(event).await
    }

    /// Apply one transport event
    ///
    /// # Errors
    ///
    /// Returns an error if the handler fails unrecoverably.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> anyhow::Result<()> {
        match event {
            TransportEvent::Connected => self.on_connected().await?,
            TransportEvent::ConnectError(reason) => self.on_connect_error(&reason).await,
            TransportEvent::Disconnected(reason) => self.on_disconnected(&reason).await,
            TransportEvent::Incoming(event) => self.handle_incoming(event).await?,
        }
        Ok(())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Send a user message
    ///
    /// Ignored when there is nothing to send, a turn is outstanding, or the
    /// channel is down. Without an active conversation one is created first:
    /// over REST when signed in, or by asking the guest backend and queueing
    /// the message until `guest_conversation_created` arrives.
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably; request
    /// failures become notifications.
    pub async fn send_message(
        &mut self,
        text: &str,
        attachments: Vec<String>,
        generate_images: bool,
    ) -> anyhow::Result<()> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Ok(());
        }
        if self.state.is_loading() || self.pending_send.is_some() {
            tracing::debug!("Turn outstanding; send ignored");
            return Ok(());
        }
        if !self.connection.is_connected() {
            tracing::warn!("Real-time channel not connected; send ignored");
            return Ok(());
        }

        let guest = self.is_guest_session();
        if !guest && !self.authenticated {
            tracing::warn!("Sign-in required to send messages");
            self.notify(NotifyLevel::Warning, "Sign in or continue as guest to chat")
                .await;
            return Ok(());
        }

        self.cancelled = false;
        let pending = PendingSend {
            text: text.to_string(),
            attachments,
            generate_images,
        };

        let target = match self.state.current_conversation_id().cloned() {
            Some(id) => Some(id),
            None => match self.backend.create().await {
                Ok(BackendReply::Ready(conversation)) => {
                    let id = conversation.id.clone();
                    tracing::info!(conversation_id = %id, "Created conversation for first message");
                    self.state.upsert_conversation(conversation);
                    self.publish_conversations().await;
                    self.activate_conversation(Some(id.clone())).await;
                    self.env
                        .location
                        .set_conversation_param(Some(&id.to_string()));
                    Some(id)
                }
                Ok(BackendReply::Emit(event)) => {
                    if let Err(e) = self.connection.emit(event).await {
                        tracing::warn!(error = %e, "Failed to request guest conversation");
                        self.notify(NotifyLevel::Error, "Could not start a conversation")
                            .await;
                        return Ok(());
                    }
                    None
                }
                Ok(BackendReply::Deferred) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create conversation");
                    self.notify(NotifyLevel::Error, &format!("Could not create conversation: {e}"))
                        .await;
                    self.set_loading(false).await;
                    return Ok(());
                }
            },
        };

        self.seal_reply().await;
        let message = ChatMessage::user(pending.text.clone(), &pending.attachments);
        self.state.push_message(message.clone());
        self.publish(SessionUpdate::MessageAppended(message)).await;
        self.input.clear();
        self.publish(SessionUpdate::InputCleared).await;
        self.set_loading(true).await;
        self.begin_turn();

        match target {
            Some(id) => self.dispatch(id, pending).await,
            None => {
                tracing::debug!("Queued message until the guest conversation exists");
                self.pending_send = Some(pending);
            }
        }
        Ok(())
    }

    /// Clear the view and forget the active conversation
    ///
    /// Purely local; a new conversation is created on the next send.
    pub async fn start_new_chat(&mut self) {
        self.abandon_turn().await;
        self.set_loading(false).await;
        self.state.reset_conversation();
        self.state.set_guest_mode(false);
        self.env.location.set_conversation_param(None);
        self.publish(SessionUpdate::MessagesReplaced(Vec::new())).await;
        self.publish(SessionUpdate::ConversationChanged(None)).await;
    }

    /// Show a conversation's history
    ///
    /// Guest histories arrive later as `guest_conversation_data`; stored ones
    /// are fetched over REST and written to the location.
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably.
    pub async fn load_conversation(&mut self, id: ConversationId, guest: bool) -> anyhow::Result<()> {
        self.abandon_turn().await;
        self.set_loading(true).await;

        if guest {
            let id = match id {
                ConversationId::Numeric(n) => ConversationId::Guest(n.to_string()),
                guest_id @ ConversationId::Guest(_) => guest_id,
            };
            self.activate_conversation(Some(id.clone())).await;
            match RealtimeGuestBackend::new().fetch(&id).await {
                Ok(BackendReply::Emit(event)) => {
                    if let Err(e) = self.connection.emit(event).await {
                        tracing::warn!(error = %e, conversation_id = %id, "Failed to request guest history");
                        self.set_loading(false).await;
                    }
                }
                Ok(_) => self.set_loading(false).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Guest history request rejected");
                    self.set_loading(false).await;
                }
            }
            return Ok(());
        }

        if !self.authenticated {
            tracing::warn!(conversation_id = %id, "Sign-in required to load conversation");
            self.set_loading(false).await;
            return Ok(());
        }

        self.activate_conversation(Some(id.clone())).await;
        self.env
            .location
            .set_conversation_param(Some(&id.to_string()));

        match self.backend.fetch(&id).await {
            Ok(BackendReply::Ready(messages)) => {
                tracing::debug!(conversation_id = %id, count = messages.len(), "Loaded history");
                self.state.replace_messages(messages.clone());
                self.state.set_guest_mode(false);
                self.publish(SessionUpdate::MessagesReplaced(messages)).await;
            }
            Ok(BackendReply::Emit(event)) => {
                if let Err(e) = self.connection.emit(event).await {
                    tracing::warn!(error = %e, "Failed to request history");
                }
                return Ok(());
            }
            Ok(BackendReply::Deferred) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, conversation_id = %id, "Failed to load conversation");
                self.notify(NotifyLevel::Error, &format!("Could not load conversation: {e}"))
                    .await;
            }
        }
        self.set_loading(false).await;
        Ok(())
    }

    /// Delete a stored conversation
    ///
    /// Deleting the active conversation switches to the first remaining one,
    /// or to an empty view when none remain.
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably.
    pub async fn delete_conversation(&mut self, id: &ConversationId) -> anyhow::Result<()> {
        if !self.authenticated {
            tracing::debug!(conversation_id = %id, "Delete ignored outside an authenticated session");
            return Ok(());
        }
        if let Err(e) = self.backend.delete(id).await {
            tracing::warn!(error = %e, conversation_id = %id, "Failed to delete conversation");
            self.notify(NotifyLevel::Error, &format!("Could not delete conversation: {e}"))
                .await;
            return Ok(());
        }

        self.state.remove_conversation(id);
        self.publish_conversations().await;

        if self.state.current_conversation_id() != Some(id) {
            return Ok(());
        }

        self.state.clear_messages();
        self.publish(SessionUpdate::MessagesReplaced(Vec::new())).await;

        let Some(next) = self.state.conversations().first().map(|c| c.id.clone()) else {
            self.activate_conversation(None).await;
            self.env.location.set_conversation_param(None);
            return Ok(());
        };

        self.activate_conversation(Some(next.clone())).await;
        self.env
            .location
            .set_conversation_param(Some(&next.to_string()));
        match self.backend.fetch(&next).await {
            Ok(BackendReply::Ready(messages)) => {
                self.state.replace_messages(messages.clone());
                self.publish(SessionUpdate::MessagesReplaced(messages)).await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, conversation_id = %next, "Failed to load next conversation");
            }
        }
        Ok(())
    }

    /// Rename a conversation
    ///
    /// Stored conversations are updated over REST; guest titles are local.
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably.
    pub async fn rename_conversation(&mut self, id: &ConversationId, title: &str) -> anyhow::Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(());
        }

        let result = if id.is_guest() {
            RealtimeGuestBackend::new().rename(id, title).await
        } else if self.authenticated {
            self.backend.rename(id, title).await
        } else {
            tracing::debug!(conversation_id = %id, "Rename ignored outside an authenticated session");
            return Ok(());
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, conversation_id = %id, "Failed to rename conversation");
            self.notify(NotifyLevel::Error, &format!("Could not rename conversation: {e}"))
                .await;
            return Ok(());
        }

        if self.state.rename_conversation(id, title) {
            self.publish_conversations().await;
        }
        if id.is_guest() && self.state.current_conversation_id() == Some(id) {
            self.set_guest_alias(title.to_string()).await;
        }
        Ok(())
    }

    /// Stop waiting for the current reply
    ///
    /// Only acts while loading. Anything the server still sends for the turn
    /// is discarded.
    pub async fn stop_generation(&mut self) {
        if !self.state.is_loading() {
            return;
        }
        tracing::info!("Generation stopped by user");
        self.cancelled = true;
        self.end_turn();
        self.pending_send = None;
        self.seal_reply().await;
        self.set_loading(false).await;

        let marker = ChatMessage::stopped_marker(self.config.stopped_message.clone());
        self.state.push_message(marker.clone());
        self.publish(SessionUpdate::MessageAppended(marker)).await;
    }

    /// Record the authentication state
    ///
    /// Re-selects the backend, re-evaluates the connection, reloads the
    /// conversation list and resumes the remembered conversation.
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably.
    pub async fn set_authenticated(&mut self, authenticated: bool) -> anyhow::Result<()> {
        self.authenticated = authenticated;
        self.select_backend();
        self.update_connection().await;
        self.refresh_conversations().await?;
        if authenticated && self.state.current_conversation_id().is_none() {
            self.restore_from_location().await?;
        }
        Ok(())
    }

    /// Record whether guest mode is active
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably.
    pub async fn set_guest_mode(&mut self, enabled: bool) -> anyhow::Result<()> {
        self.guest_flag = enabled;
        self.state
            .set_guest_mode(enabled || self.env.store.is_local_guest());
        self.select_backend();
        self.update_connection().await;
        Ok(())
    }

    /// Reload the conversation list
    ///
    /// Signed-in users get their stored conversations; otherwise the list is
    /// cleared and guest conversations arrive over the channel.
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably.
    pub async fn refresh_conversations(&mut self) -> anyhow::Result<()> {
        if !self.authenticated {
            if !self.state.conversations().is_empty() {
                self.state.set_conversations(Vec::new());
                self.publish_conversations().await;
            }
            return Ok(());
        }

        match self.backend.list().await {
            Ok(BackendReply::Ready(conversations)) => {
                tracing::debug!(count = conversations.len(), "Loaded conversation list");
                self.state.set_conversations(conversations);
                self.publish_conversations().await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list conversations");
                self.notify(NotifyLevel::Warning, "Could not load conversations")
                    .await;
            }
        }
        Ok(())
    }

    /// Resume the conversation named in the location
    ///
    /// Guest conversations are requested once the channel is connected.
    ///
    /// # Errors
    ///
    /// Returns an error only if a handler fails unrecoverably.
    pub async fn restore_from_location(&mut self) -> anyhow::Result<()> {
        if self.state.current_conversation_id().is_some() {
            return Ok(());
        }
        let Some(param) = self.env.location.conversation_param() else {
            self.set_loading(false).await;
            return Ok(());
        };

        let local_guest = self.env.store.is_local_guest();
        if !self.authenticated && !local_guest {
            self.set_loading(false).await;
            return Ok(());
        }

        let id = ConversationId::parse(&param, local_guest);
        tracing::info!(conversation_id = %id, "Restoring conversation from location");
        if local_guest && !self.connected {
            self.deferred_restore = Some(id);
            return Ok(());
        }
        self.load_conversation(id, local_guest).await
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    async fn on_connected(&mut self) -> anyhow::Result<()> {
        tracing::info!(session_id = %self.id, "Real-time channel connected");
        self.set_connected(true).await;
        if self.is_guest_session() {
            self.state.set_guest_mode(true);
        }
        if let Some(id) = self.deferred_restore.take() {
            self.load_conversation(id, true).await?;
        }
        Ok(())
    }

    async fn on_connect_error(&mut self, reason: &str) {
        tracing::warn!(reason = %reason, "Real-time connection failed");
        self.abandon_turn().await;
        self.set_loading(false).await;
        self.notify(NotifyLevel::Warning, &format!("Connection failed: {reason}"))
            .await;
    }

    async fn on_disconnected(&mut self, reason: &str) {
        tracing::info!(reason = %reason, "Real-time channel disconnected");
        self.set_connected(false).await;
        self.abandon_turn().await;
        self.set_loading(false).await;

        if self.authenticated || !self.env.store.is_local_guest() {
            return;
        }

        // A guest session does not survive its connection.
        self.env.store.set_local_guest(false);
        self.guest_flag = false;
        self.state.reset_conversation();
        self.state.set_guest_mode(false);
        self.state.reset_guest_alias();
        self.publish(SessionUpdate::MessagesReplaced(Vec::new())).await;
        self.publish(SessionUpdate::ConversationChanged(None)).await;
        self.select_backend();
        self.update_connection().await;
    }

    async fn handle_incoming(&mut self, event: IncomingEvent) -> anyhow::Result<()> {
        match event {
            IncomingEvent::MessageChunk(chunk) => self.on_chunk(chunk).await,
            IncomingEvent::Message(message) => self.on_final(message).await,
            IncomingEvent::GuestConversationList(list) => self.on_guest_list(list).await,
            IncomingEvent::GuestConversationCreated(created) => {
                self.on_guest_created(created).await;
            }
            IncomingEvent::GuestConversationData(data) => self.on_guest_data(data).await,
            IncomingEvent::Error(error) => self.on_error(&error).await,
            IncomingEvent::Unknown { name } => {
                tracing::debug!(event = %name, "Ignoring unknown event");
            }
        }
        Ok(())
    }

    async fn on_chunk(&mut self, chunk: MessageChunk) {
        if self.cancelled {
            tracing::trace!("Dropping chunk of a cancelled turn");
            return;
        }
        if !self.is_current(chunk.conversation_id.as_ref()) {
            tracing::debug!(conversation_id = ?chunk.conversation_id, "Dropping chunk for another conversation");
            return;
        }

        let started = self.state.append_chunk(&chunk.content) == ChunkOutcome::Started;
        self.publish(SessionUpdate::StreamChunk {
            content: chunk.content,
            started,
        })
        .await;
        self.set_loading(false).await;
        if self.phase != TurnPhase::Idle {
            self.phase = TurnPhase::Streaming;
            self.arm_deadline();
        }
    }

    async fn on_final(&mut self, message: FinalMessage) {
        if self.cancelled {
            tracing::debug!("Dropping final message of a cancelled turn");
            self.set_loading(false).await;
            return;
        }

        let guest = self.is_guest_session();
        if guest && self.state.current_conversation_id().is_none() {
            if let Some(id) = message.conversation_id.clone() {
                self.activate_conversation(Some(id)).await;
                self.state.set_guest_mode(true);
            }
        }

        if let Some(alias) = message.alias.as_deref().filter(|a| !a.is_empty()) {
            if guest {
                self.set_guest_alias(alias.to_string()).await;
            }
            if let Some(ref id) = message.conversation_id {
                if self.state.apply_alias(id, alias, guest) {
                    self.publish_conversations().await;
                }
            }
        }

        if !self.is_current(message.conversation_id.as_ref()) {
            tracing::debug!(conversation_id = ?message.conversation_id, "Final message for another conversation");
            return;
        }

        let reply = message.to_chat_message();
        self.state.finalize_reply(reply.clone());
        self.publish(SessionUpdate::ReplyFinalized(reply)).await;
        self.end_turn();
        self.set_loading(false).await;
    }

    async fn on_guest_list(&mut self, list: Vec<GuestConversationSummary>) {
        let default_title = self.config.titles.guest_conversation.clone();
        let conversations = list
            .iter()
            .map(|c| Conversation::guest(c.id.clone(), alias_or(c.alias.as_deref(), &default_title)))
            .collect();
        self.state.set_conversations(conversations);
        self.publish_conversations().await;

        if let Some(first) = list.first() {
            if self.state.current_conversation_id().is_none() {
                self.activate_conversation(Some(ConversationId::Guest(first.id.clone())))
                    .await;
            }
            self.set_guest_alias(alias_or(first.alias.as_deref(), &default_title))
                .await;
        }
    }

    async fn on_guest_created(&mut self, created: GuestConversationSummary) {
        let title = alias_or(created.alias.as_deref(), &self.config.titles.guest_conversation);
        let id = ConversationId::Guest(created.id.clone());
        tracing::info!(conversation_id = %id, "Guest conversation created");

        self.state.remove_conversation(&id);
        self.state
            .upsert_conversation(Conversation::guest(created.id, title.clone()));
        self.publish_conversations().await;
        self.activate_conversation(Some(id.clone())).await;
        self.set_guest_alias(title).await;

        match self.pending_send.take() {
            Some(pending) => self.dispatch(id, pending).await,
            None => {
                self.state.clear_messages();
                self.publish(SessionUpdate::MessagesReplaced(Vec::new())).await;
            }
        }
    }

    async fn on_guest_data(&mut self, data: GuestConversationData) {
        self.activate_conversation(Some(data.conversation_id.clone()))
            .await;
        if let Some(alias) = data.alias.as_deref().filter(|a| !a.is_empty()) {
            self.set_guest_alias(alias.to_string()).await;
        }
        let messages = data.chat_messages();
        tracing::debug!(conversation_id = %data.conversation_id, count = messages.len(), "Guest history received");
        self.state.replace_messages(messages.clone());
        self.publish(SessionUpdate::MessagesReplaced(messages)).await;
        self.set_loading(false).await;
    }

    async fn on_error(&mut self, error: &ErrorPayload) {
        tracing::warn!(message = %error.message, "Real-time error");
        self.pending_send = None;
        self.end_turn();
        self.seal_reply().await;

        if error.is_conversation_not_found() {
            self.state.set_conversations(Vec::new());
            self.publish_conversations().await;
            self.start_new_chat().await;
        } else {
            self.notify(NotifyLevel::Error, &error.message).await;
        }
        self.set_loading(false).await;
    }

    async fn expire_turn(&mut self) {
        self.turn_deadline = None;
        if self.phase == TurnPhase::Idle {
            return;
        }
        tracing::warn!(
            timeout_ms = self.config.turn_timeout_ms,
            "Turn timed out waiting for the reply"
        );
        self.cancelled = true;
        self.end_turn();
        self.pending_send = None;
        self.seal_reply().await;
        self.set_loading(false).await;
        self.publish(SessionUpdate::TurnTimedOut).await;
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Emit the user message for `id`, deriving a title first when the
    /// conversation still has a placeholder
    async fn dispatch(&mut self, id: ConversationId, pending: PendingSend) {
        let guest = self.is_guest_session();
        let titles = &self.config.titles;
        let placeholder = self
            .state
            .conversation(&id)
            .map_or(true, |c| titles.is_default(&c.title));
        if placeholder && !pending.text.trim().is_empty() {
            if guest {
                let title = derive_title(&pending.text, titles.max_title_chars);
                self.set_guest_alias(title).await;
            }
            if self.state.apply_derived_title(&id, &pending.text).is_some() {
                self.publish_conversations().await;
            }
        }

        let event = OutgoingEvent::UserMessage(UserMessagePayload {
            conversation_id: Some(id.clone()),
            message: pending.text,
            image_url: pending.attachments.into_iter().next(),
            generate_images: pending.generate_images,
        });
        tracing::debug!(conversation_id = %id, "Dispatching user message");
        if let Err(e) = self.connection.emit(event).await {
            tracing::warn!(error = %e, "Failed to send message");
            self.end_turn();
            self.set_loading(false).await;
            self.notify(NotifyLevel::Error, "Message could not be sent").await;
        }
    }

    /// Whether an event's conversation id matches the active one
    ///
    /// Events without an id, or arriving while no conversation is active,
    /// are accepted. Ids compare by their textual form.
    fn is_current(&self, id: Option<&ConversationId>) -> bool {
        match (id, self.state.current_conversation_id()) {
            (Some(incoming), Some(current)) => incoming.to_string() == current.to_string(),
            _ => true,
        }
    }

    fn begin_turn(&mut self) {
        self.phase = TurnPhase::Sending;
        self.arm_deadline();
    }

    fn arm_deadline(&mut self) {
        self.turn_deadline = self.config.turn_timeout().map(|d| Instant::now() + d);
    }

    fn end_turn(&mut self) {
        self.phase = TurnPhase::Idle;
        self.turn_deadline = None;
    }

    /// Give up on the outstanding turn; late events for it are dropped
    async fn abandon_turn(&mut self) {
        if self.phase != TurnPhase::Idle {
            self.cancelled = true;
        }
        self.end_turn();
        self.pending_send = None;
        self.seal_reply().await;
    }

    /// Retire a leftover streaming reply so the next turn cannot extend or
    /// replace it
    async fn seal_reply(&mut self) {
        if let Some(sealed) = self.state.seal_streaming() {
            tracing::debug!(message_id = %sealed.id, "Kept unfinished reply");
            self.publish(SessionUpdate::ReplyFinalized(sealed)).await;
        }
    }

    fn backend_for(
        mode: BackendMode,
        api: &Arc<A>,
        config: &SessionConfig,
    ) -> Box<dyn ConversationBackend> {
        match mode {
            BackendMode::Authenticated => {
                Box::new(RestBackend::new(Arc::clone(api), config.titles.clone()))
            }
            BackendMode::Guest => Box::new(RealtimeGuestBackend::new()),
        }
    }

    fn select_backend(&mut self) {
        let mode = if self.is_guest_session() {
            BackendMode::Guest
        } else {
            BackendMode::Authenticated
        };
        if self.backend.mode() != mode {
            tracing::info!(mode = %mode, "Switched conversation backend");
            self.backend = Self::backend_for(mode, &self.api, &self.config);
        }
    }

    async fn update_connection(&mut self) {
        let inputs = ConnectionInputs {
            authenticated: self.authenticated,
            guest_mode: self.guest_flag,
            local_guest: self.env.store.is_local_guest(),
        };
        match self.connection.update(inputs).await {
            Ok(ConnectionChange::Closed) => self.set_connected(false).await,
            Ok(ConnectionChange::Opened | ConnectionChange::Unchanged) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open real-time connection");
                self.abandon_turn().await;
                self.set_loading(false).await;
                self.notify(NotifyLevel::Warning, &format!("Connection failed: {e}"))
                    .await;
            }
        }
    }

    async fn activate_conversation(&mut self, id: Option<ConversationId>) {
        if self.state.current_conversation_id() == id.as_ref() {
            return;
        }
        self.state.set_current_conversation(id.clone());
        self.publish(SessionUpdate::ConversationChanged(id)).await;
    }

    async fn set_loading(&mut self, loading: bool) {
        if self.state.set_loading(loading) {
            self.publish(SessionUpdate::LoadingChanged(loading)).await;
        }
    }

    async fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.publish(SessionUpdate::ConnectionChanged(connected)).await;
        }
    }

    async fn set_guest_alias(&mut self, alias: String) {
        if self.state.set_guest_alias(alias.clone()) {
            self.publish(SessionUpdate::GuestAliasChanged(alias)).await;
        }
    }

    async fn publish_conversations(&self) {
        self.publish(SessionUpdate::ConversationsChanged(
            self.state.conversations().to_vec(),
        ))
        .await;
    }

    async fn notify(&self, level: NotifyLevel, message: &str) {
        self.publish(SessionUpdate::Notify {
            level,
            message: message.to_string(),
        })
        .await;
    }

    async fn publish(&self, update: SessionUpdate) {
        if let Err(e) = self.updates.send(update).await {
            tracing::warn!("Failed to publish session update: {}", e);
        }
    }
}

fn alias_or(alias: Option<&str>, default: &str) -> String {
    alias
        .filter(|a| !a.is_empty())
        .unwrap_or(default)
        .to_string()
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
