//! Conversation Backend Trait
//!
//! Authenticated and guest sessions manage conversations through different
//! channels: the REST API answers synchronously, while the guest backend
//! answers over the real-time channel. [`BackendReply`] lets one trait cover
//! both: either the result is ready, or an event must be emitted and the
//! result will arrive later as an incoming event.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::ApiError;
use crate::events::OutgoingEvent;
use crate::messages::{ChatMessage, Conversation, ConversationId};

/// Which backend a session is using
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendMode {
    /// Stored conversations over REST
    Authenticated,
    /// In-memory conversations over the real-time channel
    Guest,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => write!(f, "authenticated"),
            Self::Guest => write!(f, "guest"),
        }
    }
}

/// Result of a backend operation
#[derive(Clone, Debug, PartialEq)]
pub enum BackendReply<T> {
    /// The result is available now
    Ready(T),
    /// Emit this event; the result arrives as an incoming event
    Emit(OutgoingEvent),
    /// Nothing to do now; the result is pushed by the server on its own
    Deferred,
}

/// Errors from a conversation backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The REST call failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The operation does not exist in this mode
    #[error("{operation} is not supported for {mode} conversations")]
    Unsupported {
        /// Operation name
        operation: &'static str,
        /// Active mode
        mode: BackendMode,
    },

    /// The id belongs to the other mode's id space
    #[error("conversation id {0} is not valid here")]
    InvalidId(ConversationId),
}

/// Conversation management for one session mode
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Mode served by this backend
    fn mode(&self) -> BackendMode;

    /// List conversations
    async fn list(&self) -> Result<BackendReply<Vec<Conversation>>, BackendError>;

    /// Create a conversation
    async fn create(&self) -> Result<BackendReply<Conversation>, BackendError>;

    /// Fetch a conversation's messages
    async fn fetch(&self, id: &ConversationId) -> Result<BackendReply<Vec<ChatMessage>>, BackendError>;

    /// Delete a conversation
    async fn delete(&self, id: &ConversationId) -> Result<(), BackendError>;

    /// Persist a new title
    async fn rename(&self, id: &ConversationId, title: &str) -> Result<(), BackendError>;
}
