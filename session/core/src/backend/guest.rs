//! In-memory guest conversations over the real-time channel
//!
//! The guest backend never answers directly. Creating and loading emit an
//! event whose reply (`guest_conversation_created`, `guest_conversation_data`)
//! is handled by the session controller; the list is pushed by the server
//! when the connection opens.

use async_trait::async_trait;

use super::traits::{BackendError, BackendMode, BackendReply, ConversationBackend};
use crate::events::OutgoingEvent;
use crate::messages::{ChatMessage, Conversation, ConversationId};

/// Backend for guest sessions
#[derive(Clone, Copy, Debug, Default)]
pub struct RealtimeGuestBackend;

impl RealtimeGuestBackend {
    /// Create a guest backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConversationBackend for RealtimeGuestBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Guest
    }

    async fn list(&self) -> Result<BackendReply<Vec<Conversation>>, BackendError> {
        Ok(BackendReply::Deferred)
    }

    async fn create(&self) -> Result<BackendReply<Conversation>, BackendError> {
        Ok(BackendReply::Emit(OutgoingEvent::GuestNewConversation))
    }

    async fn fetch(&self, id: &ConversationId) -> Result<BackendReply<Vec<ChatMessage>>, BackendError> {
        if !id.is_guest() {
            return Err(BackendError::InvalidId(id.clone()));
        }
        Ok(BackendReply::Emit(OutgoingEvent::GuestGetConversation {
            conversation_id: id.clone(),
        }))
    }

    async fn delete(&self, _id: &ConversationId) -> Result<(), BackendError> {
        Err(BackendError::Unsupported {
            operation: "delete",
            mode: BackendMode::Guest,
        })
    }

    async fn rename(&self, _id: &ConversationId, _title: &str) -> Result<(), BackendError> {
        // Guest titles only live in the local list.
        Ok(())
    }
}
