//! Sessions and messages as the UI layer sees them.
//!
//! A [`Session`] owns its message list. Messages are mutable only while
//! `partial` is set; the [`crate::assembler::MessageAssembler`] is the one
//! writer during streaming.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Set while tokens are still arriving.
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

impl Message {
    /// A finalized message with the given content.
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            partial: false,
            error: None,
            timestamp_ms: now_ms(),
        }
    }

    /// An empty assistant message that is about to receive tokens.
    pub fn streaming(id: impl Into<String>) -> Self {
        Self {
            partial: true,
            ..Self::new(id, Role::Assistant, String::new())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Processing,
    Completed,
    Error,
}

/// One logical conversation or optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub messages: Vec<Message>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            created_at_ms: now,
            updated_at_ms: now,
            messages: Vec::new(),
            status: SessionStatus::Idle,
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Append a message and bump `updated_at_ms`.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at_ms = now_ms().max(self.updated_at_ms);
    }

    /// Ids of messages still receiving tokens.
    pub fn partial_ids(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.partial)
            .map(|m| m.id.clone())
            .collect()
    }
}
