//! Chat Data Model
//!
//! Messages and conversations as the session sees them. Everything a surface
//! renders is built from these types; the wire formats of the REST API and the
//! real-time channel are mapped into them at the edges.
//!
//! # Message identity
//!
//! At most one message in a session carries the streaming sentinel id
//! (`streaming-ai`). It is the assistant reply currently being assembled from
//! chunks. When the final message for the turn arrives, the sentinel is
//! replaced in place by a message with a server-derived id (`ai-<id>`).
//! A turn that ends without its final message keeps the partial text under a
//! local `partial-<ts>-<seq>` id.
//!
//! Local ids (`user-`, `stopped-`, `partial-`) carry a process-wide sequence
//! number after the timestamp, so two messages created in the same
//! millisecond still differ.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id carried by the in-progress assistant reply
pub const STREAMING_MESSAGE_ID: &str = "streaming-ai";

/// Separator used by the backend when several attachment URLs share one field
pub const ATTACHMENT_SEPARATOR: char = ';';

static LOCAL_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_local_seq() -> u64 {
    LOCAL_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Unique message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// The sentinel id of the reply being streamed
    #[must_use]
    pub fn streaming() -> Self {
        Self(STREAMING_MESSAGE_ID.to_string())
    }

    /// Id for a locally appended user message
    #[must_use]
    pub fn user(timestamp_ms: i64) -> Self {
        Self(format!("user-{timestamp_ms}-{}", next_local_seq()))
    }

    /// Id for a finalized assistant reply, derived from the server's id
    #[must_use]
    pub fn assistant(server_id: &RecordId) -> Self {
        Self(format!("ai-{server_id}"))
    }

    /// Id for the local marker appended when generation is stopped
    #[must_use]
    pub fn stopped(timestamp_ms: i64) -> Self {
        Self(format!("stopped-{timestamp_ms}-{}", next_local_seq()))
    }

    /// Id for a streamed reply whose turn ended without a final message
    #[must_use]
    pub fn partial(timestamp_ms: i64) -> Self {
        Self(format!("partial-{timestamp_ms}-{}", next_local_seq()))
    }

    /// Whether this is the streaming sentinel
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.0 == STREAMING_MESSAGE_ID
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author of a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The local user
    User,
    /// The assistant
    Ai,
}

/// A single message in the visible conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id (see module docs for the id scheme)
    pub id: MessageId,
    /// Who wrote it
    pub sender: Sender,
    /// Text content, possibly empty for attachment-only messages
    pub content: String,
    /// Attachment URLs in display order
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    /// Local marker appended by a stop request
    #[serde(default)]
    pub stopped: bool,
}

impl ChatMessage {
    /// A user message appended optimistically when a turn starts
    ///
    /// Only the first attachment travels with the outgoing message, so only
    /// that one is kept locally.
    #[must_use]
    pub fn user(content: impl Into<String>, attachments: &[String]) -> Self {
        let timestamp = now_ms();
        Self {
            id: MessageId::user(timestamp),
            sender: Sender::User,
            content: content.into(),
            attachments: attachments.iter().take(1).cloned().collect(),
            timestamp,
            stopped: false,
        }
    }

    /// A fresh streaming reply seeded with the first fragment
    #[must_use]
    pub fn streaming(fragment: impl Into<String>) -> Self {
        Self {
            id: MessageId::streaming(),
            sender: Sender::Ai,
            content: fragment.into(),
            attachments: Vec::new(),
            timestamp: now_ms(),
            stopped: false,
        }
    }

    /// The marker appended when the user stops generation
    #[must_use]
    pub fn stopped_marker(text: impl Into<String>) -> Self {
        let timestamp = now_ms();
        Self {
            id: MessageId::stopped(timestamp),
            sender: Sender::Ai,
            content: text.into(),
            attachments: Vec::new(),
            timestamp,
            stopped: true,
        }
    }

    /// Whether this is the in-progress streaming reply
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.id.is_streaming()
    }

    /// Append a streamed fragment
    pub fn append(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }

    /// Give a streaming reply a permanent local id
    pub fn seal(&mut self) {
        if self.is_streaming() {
            self.id = MessageId::partial(self.timestamp);
        }
    }
}

/// An id as the backend sends it: numeric for stored rows, text for guest data
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Integer primary key
    Numeric(i64),
    /// Opaque string id
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Conversation identifier
///
/// Authenticated conversations are numeric rows in the backend database.
/// Guest conversations live only in the backend's memory and carry opaque
/// string ids. The two id spaces never mix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConversationId {
    /// Stored conversation of an authenticated user
    Numeric(i64),
    /// In-memory guest conversation
    Guest(String),
}

impl ConversationId {
    /// Parse a textual id in the id space of the given mode
    ///
    /// In guest mode every id is opaque. Outside it, non-numeric text is kept
    /// as a guest id so that it is rejected by the stored-conversation backend
    /// instead of silently coerced.
    #[must_use]
    pub fn parse(text: &str, guest: bool) -> Self {
        let text = text.trim();
        if guest {
            return Self::Guest(text.to_string());
        }
        text.parse::<i64>()
            .map_or_else(|_| Self::Guest(text.to_string()), Self::Numeric)
    }

    /// Whether this id belongs to the guest id space
    #[must_use]
    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest(_))
    }

    /// The numeric id, if this is a stored conversation
    #[must_use]
    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            Self::Numeric(n) => Some(*n),
            Self::Guest(_) => None,
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Guest(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for ConversationId {
    fn from(id: i64) -> Self {
        Self::Numeric(id)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self::Guest(id.to_string())
    }
}

/// A conversation entry in the sidebar list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id
    pub id: ConversationId,
    /// Display title (alias when set)
    pub title: String,
    /// Whether this is an in-memory guest conversation
    pub is_guest: bool,
}

impl Conversation {
    /// A stored conversation
    #[must_use]
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            is_guest: false,
        }
    }

    /// A guest conversation
    #[must_use]
    pub fn guest(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: ConversationId::Guest(id.into()),
            title: title.into(),
            is_guest: true,
        }
    }
}

/// A message as returned by history endpoints (REST or guest data events)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Server id
    pub id: RecordId,
    /// Owning conversation, when the server includes it
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Who wrote it
    pub sender: Sender,
    /// Text content
    #[serde(default)]
    pub content: Option<String>,
    /// Attachment URL field; may hold several URLs joined by `;`
    #[serde(default)]
    pub image_url: Option<String>,
    /// Attachment URL list, preferred over `image_url` when non-empty
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
    /// ISO-8601 creation time
    #[serde(default)]
    pub created_at: Option<String>,
}

impl HistoryMessage {
    /// Convert into the local message shape
    #[must_use]
    pub fn into_chat_message(self) -> ChatMessage {
        let attachments = collect_attachments(self.image_urls, self.image_url.as_deref());
        ChatMessage {
            id: MessageId(self.id.to_string()),
            sender: self.sender,
            content: self.content.unwrap_or_default(),
            attachments,
            timestamp: parse_timestamp(self.created_at.as_deref()),
            stopped: false,
        }
    }
}

/// Pick attachments from a URL list, falling back to a `;`-joined field
#[must_use]
pub fn collect_attachments(list: Option<Vec<String>>, joined: Option<&str>) -> Vec<String> {
    match list {
        Some(urls) if !urls.is_empty() => urls,
        _ => joined.map(split_attachment_urls).unwrap_or_default(),
    }
}

/// Split a `;`-joined attachment field, dropping empty entries
#[must_use]
pub fn split_attachment_urls(joined: &str) -> Vec<String> {
    joined
        .split(ATTACHMENT_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parse an ISO-8601 timestamp into epoch milliseconds
///
/// Timestamps without an offset are read as UTC. Missing or unparseable values
/// fall back to the current time.
#[must_use]
pub fn parse_timestamp(value: Option<&str>) -> i64 {
    let Some(raw) = value.map(str::trim).filter(|s| !s.is_empty()) else {
        return now_ms();
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.timestamp_millis();
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return naive.and_utc().timestamp_millis();
        }
    }
    tracing::debug!(value = raw, "Unparseable timestamp, using current time");
    now_ms()
}

/// Current time in epoch milliseconds
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Identifier of one running chat session, used to correlate log lines
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
