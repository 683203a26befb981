//! Session State Store
//!
//! The observable state of one chat session: visible messages, the current
//! conversation, the conversation list, loading flag and guest alias. The
//! store enforces the message invariants; the controller decides when each
//! operation applies.

use serde::{Deserialize, Serialize};

use crate::messages::{ChatMessage, Conversation, ConversationId};

/// Default titles and derived-title limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleDefaults {
    /// Title of a freshly created stored conversation
    pub new_conversation: String,
    /// Title of a guest conversation without an alias
    pub guest_conversation: String,
    /// Prefix for numbered fallback titles (`Chat 12`)
    pub numbered_prefix: String,
    /// Characters kept when a title is derived from message text
    pub max_title_chars: usize,
}

impl Default for TitleDefaults {
    fn default() -> Self {
        Self {
            new_conversation: "New Conversation".to_string(),
            guest_conversation: "Guest Chat".to_string(),
            numbered_prefix: "Chat ".to_string(),
            max_title_chars: 40,
        }
    }
}

impl TitleDefaults {
    /// Whether `title` is one of the placeholders a derived title may replace
    #[must_use]
    pub fn is_default(&self, title: &str) -> bool {
        title == self.new_conversation
            || title == self.guest_conversation
            || title
                .strip_prefix(&self.numbered_prefix)
                .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
    }

    /// Fallback title for a stored conversation with neither alias nor title
    #[must_use]
    pub fn numbered(&self, id: &ConversationId) -> String {
        format!("{}{id}", self.numbered_prefix)
    }
}

/// Derive a conversation title from message text
///
/// The text is trimmed and cut to `max_chars` characters, with `...` appended
/// when anything was cut.
#[must_use]
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > max_chars {
        let head: String = trimmed.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

/// What happened when a chunk was applied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// A new streaming reply was appended
    Started,
    /// The existing streaming reply grew
    Appended,
}

/// Immutable copy of the state for surfaces
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Visible messages
    pub messages: Vec<ChatMessage>,
    /// Conversation currently shown
    pub current_conversation_id: Option<ConversationId>,
    /// Whether a reply or history load is pending
    pub is_loading: bool,
    /// Whether the session is talking to the guest backend
    pub is_guest_mode: bool,
    /// Server-assigned title of the current guest conversation
    pub guest_alias: String,
    /// Sidebar list
    pub conversations: Vec<Conversation>,
    /// Whether the visible conversation has any messages
    pub is_chat_started: bool,
}

/// Observable session state
#[derive(Clone, Debug)]
pub struct SessionState {
    messages: Vec<ChatMessage>,
    current_conversation_id: Option<ConversationId>,
    is_loading: bool,
    is_guest_mode: bool,
    guest_alias: String,
    conversations: Vec<Conversation>,
    titles: TitleDefaults,
}

impl SessionState {
    /// Empty state using the given title defaults
    #[must_use]
    pub fn new(titles: TitleDefaults) -> Self {
        Self {
            messages: Vec::new(),
            current_conversation_id: None,
            is_loading: false,
            is_guest_mode: false,
            guest_alias: titles.guest_conversation.clone(),
            conversations: Vec::new(),
            titles,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Visible messages
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Current conversation id
    #[must_use]
    pub fn current_conversation_id(&self) -> Option<&ConversationId> {
        self.current_conversation_id.as_ref()
    }

    /// Loading flag
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// Guest flag
    #[must_use]
    pub fn is_guest_mode(&self) -> bool {
        self.is_guest_mode
    }

    /// Guest alias
    #[must_use]
    pub fn guest_alias(&self) -> &str {
        &self.guest_alias
    }

    /// Sidebar list
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Title defaults
    #[must_use]
    pub fn titles(&self) -> &TitleDefaults {
        &self.titles
    }

    /// Whether any message is visible
    #[must_use]
    pub fn is_chat_started(&self) -> bool {
        !self.messages.is_empty()
    }

    /// The streaming reply, if one is in progress
    ///
    /// Only the last message can be the reply in progress.
    #[must_use]
    pub fn streaming_message(&self) -> Option<&ChatMessage> {
        self.messages.last().filter(|m| m.is_streaming())
    }

    /// Look up a conversation in the list
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// Copy the state for surfaces
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.messages.clone(),
            current_conversation_id: self.current_conversation_id.clone(),
            is_loading: self.is_loading,
            is_guest_mode: self.is_guest_mode,
            guest_alias: self.guest_alias.clone(),
            conversations: self.conversations.clone(),
            is_chat_started: self.is_chat_started(),
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append a complete message
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Apply a streamed fragment
    ///
    /// Extends the streaming reply when it is the last message; otherwise a new
    /// streaming reply is appended.
    pub fn append_chunk(&mut self, fragment: &str) -> ChunkOutcome {
        if let Some(last) = self.messages.last_mut() {
            if last.is_streaming() {
                last.append(fragment);
                return ChunkOutcome::Appended;
            }
        }
        self.messages.push(ChatMessage::streaming(fragment));
        ChunkOutcome::Started
    }

    /// Install the final reply for a turn
    ///
    /// Replaces the streaming reply in place when it is the last message,
    /// otherwise appends. Returns the index of the final message.
    pub fn finalize_reply(&mut self, message: ChatMessage) -> usize {
        match self.messages.last_mut() {
            Some(last) if last.is_streaming() => *last = message,
            _ => self.messages.push(message),
        }
        self.messages.len() - 1
    }

    /// Keep an unfinished streaming reply as an ordinary message
    ///
    /// Returns the sealed message when the last message was streaming.
    pub fn seal_streaming(&mut self) -> Option<ChatMessage> {
        let last = self.messages.last_mut().filter(|m| m.is_streaming())?;
        last.seal();
        Some(last.clone())
    }

    /// Replace every visible message
    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    /// Remove every visible message
    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Set the loading flag, returning whether it changed
    pub fn set_loading(&mut self, loading: bool) -> bool {
        let changed = self.is_loading != loading;
        self.is_loading = loading;
        changed
    }

    /// Set the guest flag
    pub fn set_guest_mode(&mut self, guest: bool) {
        self.is_guest_mode = guest;
    }

    /// Set the guest alias, returning whether it changed
    pub fn set_guest_alias(&mut self, alias: impl Into<String>) -> bool {
        let alias = alias.into();
        let changed = self.guest_alias != alias;
        self.guest_alias = alias;
        changed
    }

    /// Reset the guest alias to the default guest title
    pub fn reset_guest_alias(&mut self) {
        self.guest_alias = self.titles.guest_conversation.clone();
    }

    /// Switch the current conversation
    pub fn set_current_conversation(&mut self, id: Option<ConversationId>) {
        self.current_conversation_id = id;
    }

    /// Forget the current conversation and its messages
    pub fn reset_conversation(&mut self) {
        self.messages.clear();
        self.current_conversation_id = None;
    }

    // ------------------------------------------------------------------
    // Conversation list
    // ------------------------------------------------------------------

    /// Replace the conversation list
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
    }

    /// Add or replace a conversation, matched by id
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        if let Some(existing) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            *existing = conversation;
        } else {
            self.conversations.push(conversation);
        }
    }

    /// Remove a conversation from the list
    pub fn remove_conversation(&mut self, id: &ConversationId) -> Option<Conversation> {
        let index = self.conversations.iter().position(|c| &c.id == id)?;
        Some(self.conversations.remove(index))
    }

    /// Set a conversation's title unconditionally
    pub fn rename_conversation(&mut self, id: &ConversationId, title: &str) -> bool {
        match self.conversations.iter_mut().find(|c| &c.id == id) {
            Some(conversation) => {
                conversation.title = title.to_string();
                true
            }
            None => false,
        }
    }

    /// Replace a default title with one derived from `text`
    ///
    /// Returns the new title when the conversation existed with a default
    /// title. Empty text never produces a title.
    pub fn apply_derived_title(&mut self, id: &ConversationId, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }
        let title = derive_title(text, self.titles.max_title_chars);
        let titles = &self.titles;
        let conversation = self
            .conversations
            .iter_mut()
            .find(|c| &c.id == id && titles.is_default(&c.title))?;
        conversation.title.clone_from(&title);
        Some(title)
    }

    /// Apply a server-assigned alias
    ///
    /// A conversation with a default title takes the alias; one missing from
    /// the list is added with it. Explicit titles are left alone. Returns
    /// whether the list changed.
    pub fn apply_alias(&mut self, id: &ConversationId, alias: &str, guest: bool) -> bool {
        let titles = &self.titles;
        match self.conversations.iter_mut().find(|c| &c.id == id) {
            Some(conversation) if titles.is_default(&conversation.title) => {
                conversation.title = alias.to_string();
                true
            }
            Some(_) => false,
            None => {
                self.conversations.push(Conversation {
                    id: id.clone(),
                    title: alias.to_string(),
                    is_guest: guest,
                });
                true
            }
        }
    }
}
