//! REST Payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{Conversation, ConversationId, HistoryMessage, Sender};
use crate::session::TitleDefaults;

/// A user account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUser {
    /// Account id
    pub id: i64,
    /// Login name
    pub username: String,
    /// Email address
    #[serde(default)]
    pub email: String,
    /// Display name
    #[serde(default)]
    pub full_name: Option<String>,
    /// ISO-8601 creation time
    #[serde(default)]
    pub created_at: Option<String>,
    /// Avatar image URL
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Response to a successful login
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Server message
    #[serde(default)]
    pub message: String,
    /// The signed-in user
    pub user: ApiUser,
}

/// Account registration request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Login name
    pub username: String,
    /// Password
    pub password: String,
    /// Email address
    pub email: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// A stored conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationDto {
    /// Conversation id
    pub id: i64,
    /// Stored title
    #[serde(default)]
    pub title: Option<String>,
    /// User- or server-assigned alias, shown in preference to the title
    #[serde(default)]
    pub alias: Option<String>,
    /// Raw history blob kept by some backends
    #[serde(default)]
    pub history_json: Option<Vec<Value>>,
    /// ISO-8601 creation time
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ConversationDto {
    /// Display title: alias, then title, then a numbered fallback
    #[must_use]
    pub fn display_title(&self, titles: &TitleDefaults) -> String {
        self.alias
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.title.as_deref().filter(|s| !s.is_empty()))
            .map_or_else(
                || titles.numbered(&ConversationId::Numeric(self.id)),
                ToString::to_string,
            )
    }

    /// Convert into a sidebar entry
    #[must_use]
    pub fn to_conversation(&self, titles: &TitleDefaults) -> Conversation {
        Conversation::new(ConversationId::Numeric(self.id), self.display_title(titles))
    }
}

/// Body of a create-conversation request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversation {
    /// Initial title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Initial alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Body of an update-conversation request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Body of a save-message request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Owning conversation
    pub conversation_id: i64,
    /// Author
    pub sender: Sender,
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Attachment URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Response to a file upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Public URL of the stored file
    pub url: String,
}

/// Generic `{"detail": ...}` acknowledgement
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detail {
    /// Server message
    #[serde(default)]
    pub detail: Option<String>,
    /// Alternative message field used by some endpoints
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a change-password request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordChange {
    /// Current password
    pub current_password: String,
    /// Replacement password
    pub new_password: String,
}

/// Decode a message-history response
///
/// A body that is not a JSON array is treated as an empty history, and
/// malformed entries are skipped.
#[must_use]
pub fn decode_message_list(value: Value) -> Vec<HistoryMessage> {
    let Value::Array(items) = value else {
        tracing::warn!("Message history is not a list; treating as empty");
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<HistoryMessage>(item) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed history entry");
                None
            }
        })
        .collect()
}
