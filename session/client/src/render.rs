//! Plain-text rendering of session updates

use chat_session_core::{ChatMessage, NotifyLevel, Sender, SessionUpdate};

/// Turns session updates into terminal output
///
/// Streamed fragments are printed as they arrive, so the renderer remembers
/// whether a reply is open to avoid printing it twice on finalization.
#[derive(Debug, Default)]
pub struct Renderer {
    streaming: bool,
}

impl Renderer {
    /// Create a renderer
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to print for an update, if any
    pub fn render(&mut self, update: &SessionUpdate) -> Option<String> {
        match update {
            SessionUpdate::StreamChunk { content, started } => {
                self.streaming = true;
                Some(if *started {
                    format!("ai: {content}")
                } else {
                    content.clone()
                })
            }
            SessionUpdate::ReplyFinalized(message) => {
                let text = if self.streaming {
                    attachment_lines(message).unwrap_or_default()
                } else {
                    let mut text = format_message(message);
                    text.push('\n');
                    text
                };
                self.streaming = false;
                Some(format!("\n{text}"))
            }
            SessionUpdate::MessageAppended(message) if message.stopped => {
                let prefix = if self.streaming { "\n" } else { "" };
                self.streaming = false;
                Some(format!("{prefix}[{}]\n", message.content))
            }
            SessionUpdate::MessagesReplaced(messages) => {
                self.streaming = false;
                if messages.is_empty() {
                    return Some("--- empty chat ---\n".to_string());
                }
                let mut text = String::from("--- history ---\n");
                for message in messages {
                    text.push_str(&format_message(message));
                    text.push('\n');
                }
                Some(text)
            }
            SessionUpdate::ConversationChanged(Some(id)) => Some(format!("[conversation {id}]\n")),
            SessionUpdate::ConversationsChanged(conversations) => {
                let mut text = String::from("conversations:\n");
                for c in conversations {
                    text.push_str(&format!("  {:<12} {}\n", c.id.to_string(), c.title));
                }
                Some(text)
            }
            SessionUpdate::GuestAliasChanged(alias) => Some(format!("[guest chat: {alias}]\n")),
            SessionUpdate::ConnectionChanged(true) => Some("[connected]\n".to_string()),
            SessionUpdate::ConnectionChanged(false) => Some("[disconnected]\n".to_string()),
            SessionUpdate::TurnTimedOut => {
                self.streaming = false;
                Some("\n[no reply received, try again]\n".to_string())
            }
            SessionUpdate::Notify { level, message } => {
                let tag = match level {
                    NotifyLevel::Info => "info",
                    NotifyLevel::Warning => "warning",
                    NotifyLevel::Error => "error",
                };
                Some(format!("[{tag}] {message}\n"))
            }
            SessionUpdate::MessageAppended(_)
            | SessionUpdate::LoadingChanged(_)
            | SessionUpdate::ConversationChanged(None)
            | SessionUpdate::InputCleared => None,
        }
    }
}

fn format_message(message: &ChatMessage) -> String {
    let who = match message.sender {
        Sender::User => "you",
        Sender::Ai => "ai",
    };
    let mut text = format!("{who}: {}", message.content);
    if let Some(lines) = attachment_lines(message) {
        text.push('\n');
        text.push_str(lines.trim_end());
    }
    text
}

fn attachment_lines(message: &ChatMessage) -> Option<String> {
    if message.attachments.is_empty() {
        return None;
    }
    Some(
        message
            .attachments
            .iter()
            .map(|url| format!("  [attachment] {url}\n"))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_session_core::messages::{MessageId, RecordId};

    fn reply(content: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::assistant(&RecordId::Numeric(1)),
            sender: Sender::Ai,
            content: content.into(),
            attachments: Vec::new(),
            timestamp: 0,
            stopped: false,
        }
    }

    #[test]
    fn test_streamed_reply_not_repeated() {
        let mut renderer = Renderer::new();
        assert_eq!(
            renderer
                .render(&SessionUpdate::StreamChunk {
                    content: "Hel".into(),
                    started: true
                })
                .as_deref(),
            Some("ai: Hel")
        );
        assert_eq!(
            renderer
                .render(&SessionUpdate::StreamChunk {
                    content: "lo".into(),
                    started: false
                })
                .as_deref(),
            Some("lo")
        );
        assert_eq!(
            renderer
                .render(&SessionUpdate::ReplyFinalized(reply("Hello")))
                .as_deref(),
            Some("\n")
        );
    }

    #[test]
    fn test_unstreamed_reply_printed_whole() {
        let mut renderer = Renderer::new();
        assert_eq!(
            renderer
                .render(&SessionUpdate::ReplyFinalized(reply("Hi")))
                .as_deref(),
            Some("\nai: Hi\n")
        );
    }

    #[test]
    fn test_user_echo_suppressed() {
        let mut renderer = Renderer::new();
        let message = ChatMessage::user("hello", &[]);
        assert!(renderer
            .render(&SessionUpdate::MessageAppended(message))
            .is_none());
    }
}
