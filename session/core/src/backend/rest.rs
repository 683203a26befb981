//! Stored conversations over the REST API

use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{BackendError, BackendMode, BackendReply, ConversationBackend};
use crate::api::{ConversationApi, ConversationUpdate, NewConversation};
use crate::messages::{ChatMessage, Conversation, ConversationId, HistoryMessage};
use crate::session::TitleDefaults;

/// Backend for authenticated sessions
pub struct RestBackend<A: ConversationApi> {
    api: Arc<A>,
    titles: TitleDefaults,
}

impl<A: ConversationApi> RestBackend<A> {
    /// Create a backend over `api`
    pub fn new(api: Arc<A>, titles: TitleDefaults) -> Self {
        Self { api, titles }
    }

    fn numeric(id: &ConversationId) -> Result<i64, BackendError> {
        id.as_numeric()
            .ok_or_else(|| BackendError::InvalidId(id.clone()))
    }
}

#[async_trait]
impl<A: ConversationApi> ConversationBackend for RestBackend<A> {
    fn mode(&self) -> BackendMode {
        BackendMode::Authenticated
    }

    async fn list(&self) -> Result<BackendReply<Vec<Conversation>>, BackendError> {
        let dtos = self.api.list_conversations().await?;
        Ok(BackendReply::Ready(
            dtos.iter().map(|dto| dto.to_conversation(&self.titles)).collect(),
        ))
    }

    async fn create(&self) -> Result<BackendReply<Conversation>, BackendError> {
        let dto = self.api.create_conversation(&NewConversation::default()).await?;
        tracing::debug!(conversation_id = dto.id, "Created conversation");
        // The placeholder title is replaced by one derived from the first message.
        Ok(BackendReply::Ready(Conversation::new(
            ConversationId::Numeric(dto.id),
            self.titles.new_conversation.clone(),
        )))
    }

    async fn fetch(&self, id: &ConversationId) -> Result<BackendReply<Vec<ChatMessage>>, BackendError> {
        let id = Self::numeric(id)?;
        let history = self.api.get_messages(id).await?;
        Ok(BackendReply::Ready(
            history
                .into_iter()
                .map(HistoryMessage::into_chat_message)
                .collect(),
        ))
    }

    async fn delete(&self, id: &ConversationId) -> Result<(), BackendError> {
        let id = Self::numeric(id)?;
        self.api.delete_conversation(id).await?;
        Ok(())
    }

    async fn rename(&self, id: &ConversationId, title: &str) -> Result<(), BackendError> {
        let id = Self::numeric(id)?;
        let update = ConversationUpdate {
            title: None,
            alias: Some(title.to_string()),
        };
        self.api.update_conversation(id, &update).await?;
        Ok(())
    }
}
