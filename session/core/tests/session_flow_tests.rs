//! Integration tests for the chat session controller
//!
//! These tests drive a full `ChatSession` against an in-process peer and a
//! mock REST API. They cover:
//! - Streaming merge and final replacement
//! - Stop semantics and late-event discarding
//! - Turns interrupted by a new send, load, new chat or disconnect
//! - Send gating
//! - Conversation lifecycle (create, load, delete, restore)
//! - Guest flows over the real-time channel
//! - Turn deadline

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;

use chat_session_core::api::{
    ApiError, ConversationApi, ConversationDto, ConversationUpdate, NewConversation,
};
use chat_session_core::events::{
    ErrorPayload, FinalMessage, GuestConversationData, GuestConversationSummary, IncomingEvent,
    MessageChunk, OutgoingEvent, UserMessagePayload,
};
use chat_session_core::messages::{HistoryMessage, MessageId, RecordId, Sender};
use chat_session_core::storage::{LocalStore, LocationSync, MemoryLocation, MemoryStore};
use chat_session_core::transport::{InProcessConnector, InProcessPeer, TransportEvent};
use chat_session_core::{
    derive_title, BackendMode, ChatSession, ConversationId, SessionCommand, SessionConfig,
    SessionEnvironment, SessionUpdate,
};

// =============================================================================
// Test Fixtures
// =============================================================================

/// REST API double with a small in-memory conversation table
#[derive(Default)]
struct MockApi {
    conversations: Mutex<Vec<ConversationDto>>,
    history: Mutex<Vec<(i64, Vec<HistoryMessage>)>>,
    deleted: Mutex<Vec<i64>>,
    next_id: Mutex<i64>,
}

impl MockApi {
    fn with_conversations(ids: &[i64]) -> Self {
        let api = Self::default();
        *api.conversations.lock() = ids.iter().map(|&id| dto(id, &format!("Topic {id}"))).collect();
        *api.history.lock() = ids
            .iter()
            .map(|&id| (id, vec![history(id * 10, Sender::User, &format!("question {id}"))]))
            .collect();
        api
    }
}

fn dto(id: i64, title: &str) -> ConversationDto {
    ConversationDto {
        id,
        title: Some(title.to_string()),
        alias: None,
        history_json: None,
        created_at: None,
    }
}

fn history(id: i64, sender: Sender, content: &str) -> HistoryMessage {
    HistoryMessage {
        id: RecordId::Numeric(id),
        conversation_id: None,
        sender,
        content: Some(content.to_string()),
        image_url: None,
        image_urls: None,
        created_at: Some("2024-05-01T10:00:00".to_string()),
    }
}

#[async_trait]
impl ConversationApi for MockApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationDto>, ApiError> {
        Ok(self.conversations.lock().clone())
    }

    async fn create_conversation(
        &self,
        _request: &NewConversation,
    ) -> Result<ConversationDto, ApiError> {
        let mut next = self.next_id.lock();
        let id = 100 + *next;
        *next += 1;
        let created = dto(id, "New Conversation");
        self.conversations.lock().push(created.clone());
        Ok(created)
    }

    async fn update_conversation(
        &self,
        id: i64,
        update: &ConversationUpdate,
    ) -> Result<ConversationDto, ApiError> {
        let mut conversations = self.conversations.lock();
        let conversation = conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ApiError::from_response(404, r#"{"detail":"Conversation not found"}"#))?;
        conversation.alias.clone_from(&update.alias);
        Ok(conversation.clone())
    }

    async fn delete_conversation(&self, id: i64) -> Result<(), ApiError> {
        self.conversations.lock().retain(|c| c.id != id);
        self.deleted.lock().push(id);
        Ok(())
    }

    async fn get_messages(&self, id: i64) -> Result<Vec<HistoryMessage>, ApiError> {
        Ok(self
            .history
            .lock()
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, messages)| messages.clone())
            .unwrap_or_default())
    }
}

struct Fixture {
    session: ChatSession<MockApi, InProcessConnector>,
    peer: InProcessPeer,
    api: Arc<MockApi>,
    env: SessionEnvironment,
    _updates: mpsc::Receiver<SessionUpdate>,
}

/// Build a session, bring it into the requested mode and complete the
/// connection handshake
async fn fixture(api: MockApi, guest: bool, location: Option<&str>) -> Fixture {
    let (connector, mut peers) = InProcessConnector::new();
    let (updates_tx, updates) = mpsc::channel(1024);
    let api = Arc::new(api);
    let env = SessionEnvironment::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocation::new(location)),
    );

    let mut session = ChatSession::new(
        Arc::clone(&api),
        connector,
        env.clone(),
        SessionConfig::default(),
        updates_tx,
    );
    if guest {
        env.store.set_local_guest(true);
        session.set_guest_mode(true).await.unwrap();
    } else {
        session.set_authenticated(true).await.unwrap();
    }

    let peer = peers.try_recv().expect("connection opened");
    // The restore may have run before the handshake; drain until connected.
    while !session.is_connected() {
        session.poll_transport().await.unwrap();
    }

    Fixture {
        session,
        peer,
        api,
        env,
        _updates: updates,
    }
}

fn chunk(conversation: Option<ConversationId>, content: &str) -> TransportEvent {
    TransportEvent::Incoming(IncomingEvent::MessageChunk(MessageChunk {
        conversation_id: conversation,
        content: content.to_string(),
    }))
}

fn final_message(id: i64, conversation: Option<ConversationId>, content: &str) -> TransportEvent {
    TransportEvent::Incoming(IncomingEvent::Message(FinalMessage {
        id: RecordId::Numeric(id),
        conversation_id: conversation,
        content: Some(content.to_string()),
        image_url: None,
        image_urls: None,
        created_at: Some("2024-05-01T10:00:05".to_string()),
        alias: None,
    }))
}

fn sentinel_count(session: &ChatSession<MockApi, InProcessConnector>) -> usize {
    session
        .state()
        .messages()
        .iter()
        .filter(|m| m.is_streaming())
        .count()
}

// =============================================================================
// Streaming Merge
// =============================================================================

#[tokio::test]
async fn test_chunks_concatenate_into_one_sentinel() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    let id = Some(ConversationId::Numeric(100));

    for fragment in ["The ", "quick ", "brown ", "fox"] {
        f.session
            .handle_transport_event(chunk(id.clone(), fragment))
            .await
            .unwrap();
        assert_eq!(sentinel_count(&f.session), 1);
    }

    let streaming = f.session.state().streaming_message().unwrap();
    assert_eq!(streaming.content, "The quick brown fox");
    assert_eq!(f.session.state().messages().len(), 2);
}

#[tokio::test]
async fn test_final_replaces_sentinel_in_place() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    let id = Some(ConversationId::Numeric(100));

    f.session.handle_transport_event(chunk(id.clone(), "Hi")).await.unwrap();
    f.session
        .handle_transport_event(chunk(id.clone(), " there"))
        .await
        .unwrap();
    let before = f.session.state().messages().len();

    f.session
        .handle_transport_event(final_message(7, id.clone(), "Hi there"))
        .await
        .unwrap();

    let messages = f.session.state().messages();
    assert_eq!(messages.len(), before);
    assert_eq!(messages[1].id, MessageId::assistant(&RecordId::Numeric(7)));
    assert_eq!(messages[1].content, "Hi there");
    assert_eq!(sentinel_count(&f.session), 0);
    assert!(!f.session.state().is_loading());
}

#[tokio::test]
async fn test_final_without_streaming_appends() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    let before = f.session.state().messages().len();

    f.session
        .handle_transport_event(final_message(8, Some(ConversationId::Numeric(100)), "Hi"))
        .await
        .unwrap();

    assert_eq!(f.session.state().messages().len(), before + 1);
    assert!(!f.session.state().is_loading());
}

#[tokio::test]
async fn test_chunk_for_other_conversation_is_dropped() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();

    f.session
        .handle_transport_event(chunk(Some(ConversationId::Numeric(999)), "stray"))
        .await
        .unwrap();

    assert_eq!(f.session.state().messages().len(), 1);
    assert!(f.session.state().is_loading());
}

// =============================================================================
// Interrupted Turns
// =============================================================================

#[tokio::test]
async fn test_second_turn_keeps_first_partial_reply() {
    let mut f = fixture(MockApi::default(), false, None).await;
    let id = Some(ConversationId::Numeric(100));
    f.session.send_message("first", Vec::new(), false).await.unwrap();
    f.session
        .handle_transport_event(chunk(id.clone(), "partial-1"))
        .await
        .unwrap();

    // The first chunk cleared loading, so a second send goes through.
    f.session.send_message("second", Vec::new(), false).await.unwrap();
    f.session
        .handle_transport_event(chunk(id.clone(), "partial-2"))
        .await
        .unwrap();
    assert_eq!(sentinel_count(&f.session), 1);

    f.session
        .handle_transport_event(final_message(9, id, "final-2"))
        .await
        .unwrap();

    let messages = f.session.state().messages();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "partial-1", "second", "final-2"]);
    assert!(messages[1].id.0.starts_with("partial-"));
    assert_eq!(messages[3].id, MessageId::assistant(&RecordId::Numeric(9)));
    assert_eq!(sentinel_count(&f.session), 0);
    assert_ne!(messages[0].id, messages[2].id);
}

#[tokio::test]
async fn test_start_new_chat_during_guest_turn_unblocks_sending() {
    let mut f = fixture(MockApi::default(), true, None).await;
    f.session.send_message("hello", Vec::new(), false).await.unwrap();
    assert_eq!(
        f.peer.emitted.recv().await,
        Some(OutgoingEvent::GuestNewConversation)
    );
    assert!(f.session.state().is_loading());

    f.session.start_new_chat().await;
    assert!(!f.session.state().is_loading());
    assert!(f.session.state().messages().is_empty());

    f.session
        .handle_transport_event(TransportEvent::Incoming(
            IncomingEvent::GuestConversationCreated(GuestConversationSummary {
                id: "g-1".to_string(),
                alias: None,
            }),
        ))
        .await
        .unwrap();
    assert!(f.peer.emitted.try_recv().is_err());

    f.session.send_message("retry", Vec::new(), false).await.unwrap();
    assert_eq!(
        f.peer.emitted.recv().await,
        Some(OutgoingEvent::UserMessage(UserMessagePayload {
            conversation_id: Some(ConversationId::Guest("g-1".to_string())),
            message: "retry".to_string(),
            image_url: None,
            generate_images: false,
        }))
    );
    let state = f.session.state();
    assert!(state.is_loading());
    assert_eq!(state.messages().len(), 1);
    assert_eq!(state.messages()[0].content, "retry");
}

#[tokio::test]
async fn test_load_during_stream_drops_late_final() {
    let mut f = fixture(MockApi::with_conversations(&[1, 2]), false, None).await;
    let id = Some(ConversationId::Numeric(100));
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    f.session.handle_transport_event(chunk(id.clone(), "Par")).await.unwrap();

    f.session
        .load_conversation(ConversationId::Numeric(2), false)
        .await
        .unwrap();
    assert!(!f.session.state().is_loading());

    f.session
        .handle_transport_event(final_message(9, id, "late reply"))
        .await
        .unwrap();

    let state = f.session.state();
    let contents: Vec<_> = state.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["question 2"]);
    assert!(!state.is_loading());
    assert_eq!(sentinel_count(&f.session), 0);
}

#[tokio::test]
async fn test_disconnect_mid_stream_seals_partial_reply() {
    let mut f = fixture(MockApi::default(), false, None).await;
    let id = Some(ConversationId::Numeric(100));
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    f.session.handle_transport_event(chunk(id.clone(), "Par")).await.unwrap();

    f.session
        .handle_transport_event(TransportEvent::Disconnected("transport close".to_string()))
        .await
        .unwrap();
    f.session
        .handle_transport_event(final_message(9, id, "late reply"))
        .await
        .unwrap();

    let messages = f.session.state().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Par");
    assert!(messages[1].id.0.starts_with("partial-"));
    assert_eq!(sentinel_count(&f.session), 0);
    assert!(!f.session.state().is_loading());
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn test_stop_discards_rest_of_turn() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    let id = Some(ConversationId::Numeric(100));
    f.session.handle_transport_event(chunk(id.clone(), "Par")).await.unwrap();

    // Streaming already cleared loading; stop only acts while loading.
    assert!(!f.session.state().is_loading());
    f.session.stop_generation().await;
    assert_eq!(f.session.state().messages().len(), 2);

    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    f.session.stop_generation().await;

    assert!(!f.session.state().is_loading());
    let after_stop = f.session.state().messages().to_vec();
    assert_eq!(after_stop.len(), 2);
    assert!(after_stop[1].stopped);
    assert_eq!(after_stop[1].content, "Message stopped.");

    f.session.handle_transport_event(chunk(id.clone(), "late")).await.unwrap();
    f.session
        .handle_transport_event(final_message(9, id, "late reply"))
        .await
        .unwrap();
    assert_eq!(f.session.state().messages(), after_stop.as_slice());
}

#[tokio::test]
async fn test_next_send_clears_cancellation() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("first", Vec::new(), false).await.unwrap();
    f.session.stop_generation().await;

    f.session.send_message("second", Vec::new(), false).await.unwrap();
    f.session
        .handle_transport_event(chunk(Some(ConversationId::Numeric(100)), "ok"))
        .await
        .unwrap();
    assert_eq!(f.session.state().streaming_message().unwrap().content, "ok");
}

// =============================================================================
// Send Gating
// =============================================================================

#[tokio::test]
async fn test_send_is_noop_while_loading_or_empty() {
    let mut f = fixture(MockApi::default(), false, None).await;

    f.session.send_message("  ", Vec::new(), false).await.unwrap();
    assert!(f.session.state().messages().is_empty());
    assert!(f.peer.emitted.try_recv().is_err());
    assert!(f.api.conversations.lock().is_empty());

    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    let _ = f.peer.emitted.recv().await.unwrap();
    let snapshot = f.session.state().snapshot();

    f.session.send_message("Again", Vec::new(), false).await.unwrap();
    assert_eq!(f.session.state().snapshot(), snapshot);
    assert!(f.peer.emitted.try_recv().is_err());
}

#[tokio::test]
async fn test_only_first_attachment_is_sent() {
    let mut f = fixture(MockApi::default(), false, None).await;
    let attachments = vec![
        "http://files/a.png".to_string(),
        "http://files/b.png".to_string(),
    ];
    f.session.send_message("", attachments, true).await.unwrap();

    let emitted = f.peer.emitted.recv().await.unwrap();
    assert_eq!(
        emitted,
        OutgoingEvent::UserMessage(UserMessagePayload {
            conversation_id: Some(ConversationId::Numeric(100)),
            message: String::new(),
            image_url: Some("http://files/a.png".to_string()),
            generate_images: true,
        })
    );
    assert_eq!(
        f.session.state().messages()[0].attachments,
        vec!["http://files/a.png".to_string()]
    );
}

// =============================================================================
// Conversation Lifecycle
// =============================================================================

#[tokio::test]
async fn test_authenticated_first_send_creates_conversation() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();

    let state = f.session.state();
    assert_eq!(
        state.current_conversation_id(),
        Some(&ConversationId::Numeric(100))
    );
    assert_eq!(state.messages().len(), 1);
    assert_eq!(state.messages()[0].sender, Sender::User);
    assert_eq!(state.messages()[0].content, "Hello");
    assert!(state.is_loading());
    assert!(state.is_chat_started());
    assert_eq!(state.conversations()[0].title, "Hello");
    assert_eq!(f.session.input(), "");
    assert_eq!(f.env.location.conversation_param().as_deref(), Some("100"));

    f.session
        .handle_transport_event(chunk(Some(ConversationId::Numeric(100)), "Hi"))
        .await
        .unwrap();
    assert!(!f.session.state().is_loading());
}

#[tokio::test]
async fn test_long_first_message_title_is_truncated() {
    let mut f = fixture(MockApi::default(), false, None).await;
    let text = "a".repeat(45);
    f.session.send_message(&text, Vec::new(), false).await.unwrap();

    let title = &f.session.state().conversations()[0].title;
    assert_eq!(title, &format!("{}...", "a".repeat(40)));
    assert_eq!(derive_title("short title", 40), "short title");
}

#[tokio::test]
async fn test_start_new_chat_is_local() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    let _ = f.peer.emitted.recv().await;

    f.session.start_new_chat().await;
    assert!(f.session.state().messages().is_empty());
    assert!(f.session.state().current_conversation_id().is_none());
    assert!(f.env.location.conversation_param().is_none());
    assert!(f.peer.emitted.try_recv().is_err());
    assert_eq!(f.api.conversations.lock().len(), 1);
}

#[tokio::test]
async fn test_delete_non_active_keeps_view() {
    let mut f = fixture(MockApi::with_conversations(&[1, 2]), false, None).await;
    f.session
        .load_conversation(ConversationId::Numeric(1), false)
        .await
        .unwrap();
    let messages = f.session.state().messages().to_vec();
    assert_eq!(messages.len(), 1);

    f.session
        .delete_conversation(&ConversationId::Numeric(2))
        .await
        .unwrap();
    assert_eq!(f.session.state().messages(), messages.as_slice());
    assert_eq!(
        f.session.state().current_conversation_id(),
        Some(&ConversationId::Numeric(1))
    );
    assert_eq!(f.session.state().conversations().len(), 1);
}

#[tokio::test]
async fn test_delete_only_active_conversation_empties_view() {
    let mut f = fixture(MockApi::with_conversations(&[1]), false, None).await;
    f.session
        .load_conversation(ConversationId::Numeric(1), false)
        .await
        .unwrap();

    f.session
        .delete_conversation(&ConversationId::Numeric(1))
        .await
        .unwrap();
    assert!(f.session.state().messages().is_empty());
    assert!(f.session.state().current_conversation_id().is_none());
    assert!(f.session.state().conversations().is_empty());
    assert_eq!(*f.api.deleted.lock(), vec![1]);
}

#[tokio::test]
async fn test_delete_active_loads_next_remaining() {
    let mut f = fixture(MockApi::with_conversations(&[1, 2]), false, None).await;
    f.session
        .load_conversation(ConversationId::Numeric(1), false)
        .await
        .unwrap();

    f.session
        .delete_conversation(&ConversationId::Numeric(1))
        .await
        .unwrap();
    assert_eq!(
        f.session.state().current_conversation_id(),
        Some(&ConversationId::Numeric(2))
    );
    assert_eq!(f.session.state().messages()[0].content, "question 2");
}

#[tokio::test]
async fn test_restore_from_location_on_sign_in() {
    let f = fixture(MockApi::with_conversations(&[1, 2]), false, Some("2")).await;
    let state = f.session.state();
    assert_eq!(state.current_conversation_id(), Some(&ConversationId::Numeric(2)));
    assert_eq!(state.messages()[0].content, "question 2");
    assert!(!state.is_loading());
}

#[tokio::test]
async fn test_rename_stored_conversation() {
    let mut f = fixture(MockApi::with_conversations(&[1]), false, None).await;
    f.session
        .rename_conversation(&ConversationId::Numeric(1), "  Renamed  ")
        .await
        .unwrap();
    assert_eq!(f.session.state().conversations()[0].title, "Renamed");
    assert_eq!(
        f.api.conversations.lock()[0].alias.as_deref(),
        Some("Renamed")
    );
}

#[tokio::test]
async fn test_not_found_error_starts_fresh() {
    let mut f = fixture(MockApi::with_conversations(&[1]), false, None).await;
    f.session
        .load_conversation(ConversationId::Numeric(1), false)
        .await
        .unwrap();

    f.session
        .handle_transport_event(TransportEvent::Incoming(IncomingEvent::Error(ErrorPayload {
            message: "Conversation not found".to_string(),
        })))
        .await
        .unwrap();
    assert!(f.session.state().conversations().is_empty());
    assert!(f.session.state().messages().is_empty());
    assert!(f.session.state().current_conversation_id().is_none());
}

#[tokio::test]
async fn test_other_errors_end_turn_only() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();

    f.session
        .handle_transport_event(TransportEvent::Incoming(IncomingEvent::Error(ErrorPayload {
            message: "Model overloaded".to_string(),
        })))
        .await
        .unwrap();
    assert!(!f.session.state().is_loading());
    assert_eq!(f.session.state().messages().len(), 1);
    assert_eq!(
        f.session.state().current_conversation_id(),
        Some(&ConversationId::Numeric(100))
    );
}

// =============================================================================
// Connection Policy
// =============================================================================

#[tokio::test]
async fn test_sign_out_closes_connection() {
    let mut f = fixture(MockApi::with_conversations(&[1]), false, None).await;
    assert!(!f.peer.is_closed());

    f.session.set_authenticated(false).await.unwrap();
    assert!(f.peer.is_closed());
    assert!(!f.session.is_connected());
    assert!(f.session.state().conversations().is_empty());

    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    assert!(f.session.state().messages().is_empty());
}

#[tokio::test]
async fn test_disconnect_unblocks_loading() {
    let mut f = fixture(MockApi::default(), false, None).await;
    f.session.send_message("Hello", Vec::new(), false).await.unwrap();
    assert!(f.session.state().is_loading());

    f.peer.drop_connection("ping timeout").await;
    f.session.poll_transport().await.unwrap();
    assert!(!f.session.state().is_loading());
    assert!(!f.session.is_connected());
    assert_eq!(f.session.state().messages().len(), 1);
}

// =============================================================================
// Guest Mode
// =============================================================================

#[tokio::test]
async fn test_guest_session_uses_guest_backend() {
    let f = fixture(MockApi::default(), true, None).await;
    assert_eq!(f.session.backend_mode(), BackendMode::Guest);
    assert!(f.session.state().is_guest_mode());
}

#[tokio::test]
async fn test_guest_send_waits_for_created_conversation() {
    let mut f = fixture(MockApi::default(), true, None).await;
    f.session
        .send_message("Plan a trip to Lisbon", Vec::new(), false)
        .await
        .unwrap();

    assert_eq!(
        f.peer.emitted.recv().await,
        Some(OutgoingEvent::GuestNewConversation)
    );
    assert!(f.peer.emitted.try_recv().is_err());
    assert_eq!(f.session.state().messages().len(), 1);
    assert!(f.session.state().is_loading());

    f.session
        .handle_transport_event(TransportEvent::Incoming(
            IncomingEvent::GuestConversationCreated(GuestConversationSummary {
                id: "g-7".to_string(),
                alias: None,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(
        f.peer.emitted.recv().await,
        Some(OutgoingEvent::UserMessage(UserMessagePayload {
            conversation_id: Some(ConversationId::Guest("g-7".to_string())),
            message: "Plan a trip to Lisbon".to_string(),
            image_url: None,
            generate_images: false,
        }))
    );
    let state = f.session.state();
    assert_eq!(state.messages().len(), 1);
    assert_eq!(state.guest_alias(), "Plan a trip to Lisbon");
    assert_eq!(state.conversations()[0].title, "Plan a trip to Lisbon");
    assert!(f.api.conversations.lock().is_empty());
}

#[tokio::test]
async fn test_guest_load_conversation() {
    let mut f = fixture(MockApi::default(), true, None).await;
    let id = ConversationId::Guest("g-42".to_string());
    f.session.load_conversation(id.clone(), true).await.unwrap();

    assert_eq!(
        f.peer.emitted.recv().await,
        Some(OutgoingEvent::GuestGetConversation {
            conversation_id: id.clone()
        })
    );
    assert!(f.session.state().is_loading());

    f.session
        .handle_transport_event(TransportEvent::Incoming(IncomingEvent::GuestConversationData(
            GuestConversationData {
                conversation_id: id.clone(),
                alias: Some("Lisbon".to_string()),
                messages: vec![
                    json!({"id": "m1", "sender": "user", "content": "Plan a trip"}),
                    json!({"id": "m2", "sender": "ai", "content": "Sure!"}),
                    json!("not a message"),
                ],
            },
        )))
        .await
        .unwrap();

    let state = f.session.state();
    assert!(!state.is_loading());
    assert_eq!(state.current_conversation_id(), Some(&id));
    assert_eq!(state.guest_alias(), "Lisbon");
    let contents: Vec<_> = state.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["Plan a trip", "Sure!"]);
}

#[tokio::test]
async fn test_guest_list_selects_first_conversation() {
    let mut f = fixture(MockApi::default(), true, None).await;
    f.peer
        .push(IncomingEvent::GuestConversationList(vec![
            GuestConversationSummary {
                id: "g-1".to_string(),
                alias: Some("Recipes".to_string()),
            },
            GuestConversationSummary {
                id: "g-2".to_string(),
                alias: None,
            },
        ]))
        .await;
    f.session.poll_transport().await.unwrap();

    let state = f.session.state();
    assert_eq!(
        state.current_conversation_id(),
        Some(&ConversationId::Guest("g-1".to_string()))
    );
    assert_eq!(state.guest_alias(), "Recipes");
    let titles: Vec<_> = state.conversations().iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["Recipes", "Guest Chat"]);
}

#[tokio::test]
async fn test_guest_final_message_adopts_alias() {
    let mut f = fixture(MockApi::default(), true, None).await;
    f.session
        .handle_transport_event(TransportEvent::Incoming(IncomingEvent::Message(FinalMessage {
            id: RecordId::Text("m9".to_string()),
            conversation_id: Some(ConversationId::Guest("g-5".to_string())),
            content: Some("Welcome back".to_string()),
            image_url: None,
            image_urls: None,
            created_at: None,
            alias: Some("Weekend plans".to_string()),
        })))
        .await
        .unwrap();

    let state = f.session.state();
    assert_eq!(
        state.current_conversation_id(),
        Some(&ConversationId::Guest("g-5".to_string()))
    );
    assert_eq!(state.guest_alias(), "Weekend plans");
    assert_eq!(state.conversations()[0].title, "Weekend plans");
    assert_eq!(state.messages().len(), 1);
}

#[tokio::test]
async fn test_guest_disconnect_resets_session() {
    let mut f = fixture(MockApi::default(), true, None).await;
    f.session
        .handle_transport_event(TransportEvent::Incoming(
            IncomingEvent::GuestConversationCreated(GuestConversationSummary {
                id: "g-1".to_string(),
                alias: None,
            }),
        ))
        .await
        .unwrap();

    f.peer.drop_connection("transport close").await;
    f.session.poll_transport().await.unwrap();

    assert!(!f.env.store.is_local_guest());
    assert!(!f.session.state().is_guest_mode());
    assert!(f.session.state().current_conversation_id().is_none());
    assert!(f.peer.is_closed());
    assert_eq!(f.session.backend_mode(), BackendMode::Authenticated);
}

#[tokio::test]
async fn test_guest_restore_waits_for_connection() {
    let (connector, mut peers) = InProcessConnector::new();
    let (updates_tx, _updates) = mpsc::channel(1024);
    let env = SessionEnvironment::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocation::new(Some("g-3"))),
    );
    env.store.set_local_guest(true);
    let mut session = ChatSession::new(
        Arc::new(MockApi::default()),
        connector,
        env,
        SessionConfig::default(),
        updates_tx,
    );
    assert!(session.state().is_loading());

    session.set_guest_mode(true).await.unwrap();
    session.restore_from_location().await.unwrap();
    let mut peer = peers.try_recv().unwrap();
    assert!(peer.emitted.try_recv().is_err());

    session.poll_transport().await.unwrap();
    assert_eq!(
        peer.emitted.recv().await,
        Some(OutgoingEvent::GuestGetConversation {
            conversation_id: ConversationId::Guest("g-3".to_string())
        })
    );
}

// =============================================================================
// Turn Deadline
// =============================================================================

async fn wait_for_update(
    updates: &mut mpsc::Receiver<SessionUpdate>,
    matches: impl Fn(&SessionUpdate) -> bool,
) -> SessionUpdate {
    loop {
        let update = updates.recv().await.expect("session still running");
        if matches(&update) {
            return update;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_turn_times_out_without_reply() {
    let (connector, mut peers) = InProcessConnector::new();
    let (updates_tx, mut updates) = mpsc::channel(1024);
    let (commands_tx, commands) = mpsc::channel(16);
    let config = SessionConfig {
        turn_timeout_ms: 5_000,
        ..SessionConfig::default()
    };
    let session = ChatSession::new(
        Arc::new(MockApi::default()),
        connector,
        SessionEnvironment::in_memory(),
        config,
        updates_tx,
    );
    let handle = tokio::spawn(session.run(commands));

    commands_tx
        .send(SessionCommand::SetAuthenticated(true))
        .await
        .unwrap();
    wait_for_update(&mut updates, |u| *u == SessionUpdate::ConnectionChanged(true)).await;
    let _peer = peers.recv().await.unwrap();

    commands_tx
        .send(SessionCommand::SendMessage {
            text: "Hello".to_string(),
            attachments: Vec::new(),
            generate_images: false,
        })
        .await
        .unwrap();
    wait_for_update(&mut updates, |u| *u == SessionUpdate::LoadingChanged(true)).await;
    let started = tokio::time::Instant::now();

    wait_for_update(&mut updates, |u| *u == SessionUpdate::TurnTimedOut).await;
    assert!(started.elapsed() >= Duration::from_secs(4));

    commands_tx.send(SessionCommand::Shutdown).await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_stream_is_not_extended_by_next_turn() {
    let (connector, mut peers) = InProcessConnector::new();
    let (updates_tx, mut updates) = mpsc::channel(1024);
    let (commands_tx, commands) = mpsc::channel(16);
    let config = SessionConfig {
        turn_timeout_ms: 5_000,
        ..SessionConfig::default()
    };
    let session = ChatSession::new(
        Arc::new(MockApi::default()),
        connector,
        SessionEnvironment::in_memory(),
        config,
        updates_tx,
    );
    let handle = tokio::spawn(session.run(commands));

    commands_tx
        .send(SessionCommand::SetAuthenticated(true))
        .await
        .unwrap();
    wait_for_update(&mut updates, |u| *u == SessionUpdate::ConnectionChanged(true)).await;
    let mut peer = peers.recv().await.unwrap();
    let send = |text: &str| SessionCommand::SendMessage {
        text: text.to_string(),
        attachments: Vec::new(),
        generate_images: false,
    };

    commands_tx.send(send("first")).await.unwrap();
    let _ = peer.emitted.recv().await.unwrap();
    peer.push(IncomingEvent::MessageChunk(MessageChunk {
        conversation_id: Some(ConversationId::Numeric(100)),
        content: "partial".to_string(),
    }))
    .await;
    wait_for_update(&mut updates, |u| matches!(u, SessionUpdate::StreamChunk { .. })).await;

    let sealed = wait_for_update(&mut updates, |u| {
        matches!(u, SessionUpdate::ReplyFinalized(_))
    })
    .await;
    match sealed {
        SessionUpdate::ReplyFinalized(message) => {
            assert_eq!(message.content, "partial");
            assert!(message.id.0.starts_with("partial-"));
        }
        other => panic!("unexpected update {other:?}"),
    }
    wait_for_update(&mut updates, |u| *u == SessionUpdate::TurnTimedOut).await;

    commands_tx.send(send("second")).await.unwrap();
    let _ = peer.emitted.recv().await.unwrap();
    peer.push(IncomingEvent::MessageChunk(MessageChunk {
        conversation_id: Some(ConversationId::Numeric(100)),
        content: "fresh".to_string(),
    }))
    .await;
    let chunk = wait_for_update(&mut updates, |u| {
        matches!(u, SessionUpdate::StreamChunk { .. })
    })
    .await;
    assert_eq!(
        chunk,
        SessionUpdate::StreamChunk {
            content: "fresh".to_string(),
            started: true,
        }
    );

    commands_tx.send(SessionCommand::Shutdown).await.unwrap();
    handle.await.unwrap().unwrap();
}
