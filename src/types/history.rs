//! Conversation history carried through a turn.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// User message.
    #[default]
    User,
    /// Assistant/AI response.
    Assistant,
    /// System message.
    System,
    /// Tool/function call result.
    Tool,
}

impl Role {
    /// Parse role from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One message of caller-supplied conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl HistoryMessage {
    /// Create a message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Read a plain-text transcript of `role: content` lines.
    ///
    /// Lines without a known role prefix continue the previous message.
    /// Text before the first message is dropped.
    pub fn parse_transcript(text: &str) -> Vec<HistoryMessage> {
        let mut messages: Vec<HistoryMessage> = Vec::new();
        for line in text.lines() {
            let started = line
                .split_once(':')
                .and_then(|(role, rest)| Role::parse(role.trim()).map(|role| (role, rest.trim())));
            if let Some((role, content)) = started {
                messages.push(HistoryMessage::new(role, content));
                continue;
            }
            match messages.last_mut() {
                Some(last) => {
                    last.content.push('\n');
                    last.content.push_str(line);
                }
                None if !line.trim().is_empty() => {
                    debug!(line, "transcript text before first message dropped");
                }
                None => {}
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("Assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("narrator"), None);
        assert_eq!(Role::default(), Role::User);
    }

    #[test]
    fn test_parse_transcript() {
        let text = "preamble\nUser: is the bridge safe?\nassistant: checking\nthe records\nnarrator: aside\ntool: {}\n";
        let messages = HistoryMessage::parse_transcript(text);

        assert_eq!(
            messages,
            vec![
                HistoryMessage::user("is the bridge safe?"),
                HistoryMessage::assistant("checking\nthe records\nnarrator: aside"),
                HistoryMessage::new(Role::Tool, "{}"),
            ]
        );
    }

    #[test]
    fn test_role_serde_lowercase() {
        let msg = HistoryMessage::assistant("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
