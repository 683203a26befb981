//! REST API
//!
//! Typed access to the backend's HTTP endpoints. The session depends on the
//! [`ConversationApi`] and [`AccountApi`] traits; [`ApiClient`] is the
//! `reqwest` implementation.
//!
//! | Operation            | Method | Path                              |
//! |----------------------|--------|-----------------------------------|
//! | login                | POST   | `/api/auth/login`                 |
//! | register             | POST   | `/api/auth/register`              |
//! | logout               | POST   | `/api/auth/logout`                |
//! | current user         | GET    | `/api/users/me`                   |
//! | upload avatar        | POST   | `/api/users/avatar` (multipart)   |
//! | change password      | POST   | `/api/users/change-password`      |
//! | list conversations   | GET    | `/api/conversations`              |
//! | create conversation  | POST   | `/api/conversations`              |
//! | update conversation  | PUT    | `/api/conversations/{id}`         |
//! | delete conversation  | DELETE | `/api/conversations/{id}`         |
//! | messages             | GET    | `/api/conversations/{id}/messages`|
//! | save message         | POST   | `/api/messages`                   |
//! | upload attachment    | POST   | `/api/messages/upload` (multipart)|

use std::path::Path;

use async_trait::async_trait;

pub mod client;
pub mod error;
pub mod types;

pub use client::ApiClient;
pub use error::{extract_error_message, ApiError, DEFAULT_ERROR_MESSAGE};
pub use types::{
    ApiUser, ConversationDto, ConversationUpdate, LoginResponse, NewConversation, NewMessage,
    RegisterRequest, UploadResponse,
};

use crate::messages::HistoryMessage;

/// Stored-conversation endpoints
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// All conversations of the signed-in user
    async fn list_conversations(&self) -> Result<Vec<ConversationDto>, ApiError>;

    /// Create a conversation
    async fn create_conversation(&self, request: &NewConversation) -> Result<ConversationDto, ApiError>;

    /// Update a conversation's title or alias
    async fn update_conversation(
        &self,
        id: i64,
        update: &ConversationUpdate,
    ) -> Result<ConversationDto, ApiError>;

    /// Delete a conversation
    async fn delete_conversation(&self, id: i64) -> Result<(), ApiError>;

    /// Message history of a conversation
    ///
    /// A non-list response yields an empty history.
    async fn get_messages(&self, id: i64) -> Result<Vec<HistoryMessage>, ApiError>;
}

/// Account endpoints
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// Sign in; the session cookie is stored in the client's jar
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError>;

    /// Create an account
    async fn register(&self, request: &RegisterRequest) -> Result<ApiUser, ApiError>;

    /// Sign out
    async fn logout(&self) -> Result<(), ApiError>;

    /// The signed-in user; fails when no session exists
    async fn me(&self) -> Result<ApiUser, ApiError>;

    /// Change the password, returning the server's confirmation text
    async fn change_password(&self, current: &str, new: &str) -> Result<String, ApiError>;

    /// Replace the avatar image
    async fn upload_avatar(&self, path: &Path) -> Result<ApiUser, ApiError>;
}
