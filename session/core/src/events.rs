//! Real-time Events
//!
//! Named events exchanged with the backend over the real-time channel.
//!
//! ```text
//! client -> server                      server -> client
//! ----------------                      ----------------
//! user_message                          ai_message_chunk
//! guest_new_conversation                ai_message
//! guest_get_conversation                guest_conversation_list
//!                                       guest_conversation_created
//!                                       guest_conversation_data
//!                                       error
//! ```
//!
//! Outgoing events know their wire name and JSON payload. Incoming events are
//! decoded from a name plus optional JSON payload; unknown names decode to
//! [`IncomingEvent::Unknown`] so that newer servers do not break older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::messages::{
    collect_attachments, parse_timestamp, ChatMessage, ConversationId, HistoryMessage, MessageId,
    RecordId, Sender,
};

/// Fallback text when an `error` event carries no usable message
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown real-time error";

// ============================================================================
// Outgoing
// ============================================================================

/// Payload of a `user_message` event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessagePayload {
    /// Target conversation; `null` lets the server pick one
    pub conversation_id: Option<ConversationId>,
    /// Message text
    pub message: String,
    /// First attachment URL, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Whether the assistant may generate images in its reply
    pub generate_images: bool,
}

/// Events the client emits
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingEvent {
    /// Send a user message
    UserMessage(UserMessagePayload),
    /// Ask the server to create a guest conversation
    GuestNewConversation,
    /// Ask the server for a guest conversation's history
    GuestGetConversation {
        /// Guest conversation to load
        conversation_id: ConversationId,
    },
}

impl OutgoingEvent {
    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserMessage(_) => "user_message",
            Self::GuestNewConversation => "guest_new_conversation",
            Self::GuestGetConversation { .. } => "guest_get_conversation",
        }
    }

    /// JSON payload, or `None` for events without one
    #[must_use]
    pub fn payload(&self) -> Option<Value> {
        match self {
            Self::UserMessage(payload) => serde_json::to_value(payload).ok(),
            Self::GuestNewConversation => None,
            Self::GuestGetConversation { conversation_id } => {
                Some(serde_json::json!({ "conversation_id": conversation_id }))
            }
        }
    }
}

// ============================================================================
// Incoming
// ============================================================================

/// A streamed fragment of an assistant reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageChunk {
    /// Conversation the fragment belongs to
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Fragment text
    #[serde(default)]
    pub content: String,
}

/// The authoritative final assistant reply for a turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalMessage {
    /// Server id of the stored reply
    pub id: RecordId,
    /// Conversation the reply belongs to
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Full reply text
    #[serde(default)]
    pub content: Option<String>,
    /// Attachment URL field; may hold several URLs joined by `;`
    #[serde(default)]
    pub image_url: Option<String>,
    /// Attachment URL list
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
    /// ISO-8601 creation time
    #[serde(default)]
    pub created_at: Option<String>,
    /// Server-assigned conversation title
    #[serde(default)]
    pub alias: Option<String>,
}

impl FinalMessage {
    /// Local message that replaces the streaming sentinel
    #[must_use]
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            id: MessageId::assistant(&self.id),
            sender: Sender::Ai,
            content: self.content.clone().unwrap_or_default(),
            attachments: collect_attachments(self.image_urls.clone(), self.image_url.as_deref()),
            timestamp: parse_timestamp(self.created_at.as_deref()),
            stopped: false,
        }
    }
}

/// One entry of a guest conversation list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConversationSummary {
    /// Guest conversation id
    pub id: String,
    /// Server-assigned title
    #[serde(default)]
    pub alias: Option<String>,
}

/// History of a guest conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuestConversationData {
    /// Guest conversation id
    pub conversation_id: ConversationId,
    /// Server-assigned title
    #[serde(default)]
    pub alias: Option<String>,
    /// Raw message entries; malformed entries are skipped on conversion
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl GuestConversationData {
    /// Convert the history into local messages, skipping malformed entries
    #[must_use]
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter_map(|raw| match serde_json::from_value::<HistoryMessage>(raw.clone()) {
                Ok(msg) => Some(msg.into_chat_message()),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed guest history entry");
                    None
                }
            })
            .collect()
    }
}

/// Payload of an `error` event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error text
    pub message: String,
}

impl ErrorPayload {
    /// Whether the server reports the current conversation as gone
    ///
    /// Matches both "Conversation not found" and "Guest conversation not found".
    #[must_use]
    pub fn is_conversation_not_found(&self) -> bool {
        self.message
            .to_lowercase()
            .contains("conversation not found")
    }

    fn from_value(data: Option<Value>) -> Self {
        let message = match data {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string(), ToString::to_string),
            _ => UNKNOWN_ERROR_MESSAGE.to_string(),
        };
        Self { message }
    }
}

/// Events the server pushes
#[derive(Clone, Debug, PartialEq)]
pub enum IncomingEvent {
    /// `ai_message_chunk`
    MessageChunk(MessageChunk),
    /// `ai_message`
    Message(FinalMessage),
    /// `guest_conversation_list`
    GuestConversationList(Vec<GuestConversationSummary>),
    /// `guest_conversation_created`
    GuestConversationCreated(GuestConversationSummary),
    /// `guest_conversation_data`
    GuestConversationData(GuestConversationData),
    /// `error`
    Error(ErrorPayload),
    /// Any event this client does not handle
    Unknown {
        /// Wire name
        name: String,
    },
}

/// Failure to decode an incoming event payload
#[derive(Debug, Error)]
pub enum EventDecodeError {
    /// The event requires a payload but none was sent
    #[error("event `{0}` is missing its payload")]
    MissingPayload(&'static str),

    /// The payload did not match the expected shape
    #[error("invalid payload for `{event}`: {source}")]
    InvalidPayload {
        /// Event name
        event: &'static str,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },
}

impl IncomingEvent {
    /// Decode a named event and its payload
    ///
    /// # Errors
    ///
    /// Returns an error when a known event is missing its payload or the
    /// payload has the wrong shape. Unknown events never fail.
    pub fn decode(name: &str, data: Option<Value>) -> Result<Self, EventDecodeError> {
        match name {
            "ai_message_chunk" => Ok(Self::MessageChunk(parse("ai_message_chunk", data)?)),
            "ai_message" => Ok(Self::Message(parse("ai_message", data)?)),
            "guest_conversation_list" => {
                let list = match data {
                    None | Some(Value::Null) => Vec::new(),
                    Some(value) => parse("guest_conversation_list", Some(value))?,
                };
                Ok(Self::GuestConversationList(list))
            }
            "guest_conversation_created" => Ok(Self::GuestConversationCreated(parse(
                "guest_conversation_created",
                data,
            )?)),
            "guest_conversation_data" => Ok(Self::GuestConversationData(parse(
                "guest_conversation_data",
                data,
            )?)),
            "error" => Ok(Self::Error(ErrorPayload::from_value(data))),
            other => Ok(Self::Unknown {
                name: other.to_string(),
            }),
        }
    }

    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::MessageChunk(_) => "ai_message_chunk",
            Self::Message(_) => "ai_message",
            Self::GuestConversationList(_) => "guest_conversation_list",
            Self::GuestConversationCreated(_) => "guest_conversation_created",
            Self::GuestConversationData(_) => "guest_conversation_data",
            Self::Error(_) => "error",
            Self::Unknown { name } => name,
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    event: &'static str,
    data: Option<Value>,
) -> Result<T, EventDecodeError> {
    let value = data.ok_or(EventDecodeError::MissingPayload(event))?;
    serde_json::from_value(value).map_err(|source| EventDecodeError::InvalidPayload { event, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_outgoing_names() {
        assert_eq!(OutgoingEvent::GuestNewConversation.name(), "guest_new_conversation");
        assert!(OutgoingEvent::GuestNewConversation.payload().is_none());

        let load = OutgoingEvent::GuestGetConversation {
            conversation_id: ConversationId::Guest("g-1".into()),
        };
        assert_eq!(load.name(), "guest_get_conversation");
        assert_eq!(load.payload(), Some(json!({ "conversation_id": "g-1" })));
    }

    #[test]
    fn test_user_message_payload_omits_missing_image() {
        let event = OutgoingEvent::UserMessage(UserMessagePayload {
            conversation_id: Some(ConversationId::Numeric(3)),
            message: "hi".into(),
            image_url: None,
            generate_images: false,
        });
        assert_eq!(
            event.payload(),
            Some(json!({ "conversation_id": 3, "message": "hi", "generate_images": false }))
        );
    }

    #[test]
    fn test_decode_chunk() {
        let event = IncomingEvent::decode(
            "ai_message_chunk",
            Some(json!({ "conversation_id": 3, "content": "Hel" })),
        )
        .unwrap();
        assert_eq!(
            event,
            IncomingEvent::MessageChunk(MessageChunk {
                conversation_id: Some(ConversationId::Numeric(3)),
                content: "Hel".into(),
            })
        );
    }

    #[test]
    fn test_decode_final_with_alias() {
        let event = IncomingEvent::decode(
            "ai_message",
            Some(json!({
                "id": 9,
                "conversation_id": 3,
                "sender": "ai",
                "content": "Hello",
                "image_url": "a.png;b.png",
                "created_at": "2024-01-01T00:00:00",
                "alias": "Greetings"
            })),
        )
        .unwrap();
        let IncomingEvent::Message(msg) = event else {
            panic!("expected final message");
        };
        assert_eq!(msg.alias.as_deref(), Some("Greetings"));
        let chat = msg.to_chat_message();
        assert_eq!(chat.id.0, "ai-9");
        assert_eq!(chat.attachments, vec!["a.png".to_string(), "b.png".to_string()]);
    }

    #[test]
    fn test_decode_guest_list_and_data() {
        let list = IncomingEvent::decode(
            "guest_conversation_list",
            Some(json!([{ "id": "g-1", "alias": "First" }, { "id": "g-2" }])),
        )
        .unwrap();
        let IncomingEvent::GuestConversationList(list) = list else {
            panic!("expected list");
        };
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].alias, None);

        let data = IncomingEvent::decode(
            "guest_conversation_data",
            Some(json!({
                "conversation_id": "g-1",
                "messages": [
                    { "id": "m1", "sender": "user", "content": "hi", "created_at": "2024-01-01T00:00:00" },
                    { "bogus": true }
                ]
            })),
        )
        .unwrap();
        let IncomingEvent::GuestConversationData(data) = data else {
            panic!("expected data");
        };
        assert_eq!(data.chat_messages().len(), 1);
    }

    #[test]
    fn test_decode_error_shapes() {
        let obj = IncomingEvent::decode("error", Some(json!({ "message": "Conversation not found" })))
            .unwrap();
        let IncomingEvent::Error(payload) = obj else {
            panic!("expected error");
        };
        assert!(payload.is_conversation_not_found());

        let bare = IncomingEvent::decode("error", Some(json!("Guest conversation not found"))).unwrap();
        let IncomingEvent::Error(payload) = bare else {
            panic!("expected error");
        };
        assert!(payload.is_conversation_not_found());

        let empty = IncomingEvent::decode("error", None).unwrap();
        assert_eq!(
            empty,
            IncomingEvent::Error(ErrorPayload {
                message: UNKNOWN_ERROR_MESSAGE.into()
            })
        );
    }

    #[test]
    fn test_decode_unknown_and_missing_payload() {
        let unknown = IncomingEvent::decode("typing", None).unwrap();
        assert_eq!(unknown.name(), "typing");
        assert!(IncomingEvent::decode("ai_message", None).is_err());
    }
}
