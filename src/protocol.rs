use serde::{Deserialize, Serialize};

use crate::model::Role;

// -- Inbound frames ----------------------------------------------------------

/// A decoded frame from the server, independent of transport flavor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    ConnectionAck {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    TypingStart,
    TypingStop,
    StreamStart {
        #[serde(default, alias = "id")]
        message_id: Option<String>,
    },
    StreamToken {
        #[serde(default, alias = "id")]
        message_id: Option<String>,
        #[serde(alias = "content")]
        token: String,
    },
    StreamComplete {
        #[serde(default, alias = "id")]
        message_id: Option<String>,
        #[serde(default)]
        final_content: Option<String>,
    },
    Message {
        #[serde(default, alias = "id")]
        message_id: Option<String>,
        #[serde(default)]
        role: Option<Role>,
        content: String,
    },
    OptimizationResult {
        #[serde(default)]
        data: serde_json::Value,
    },
    TemplateOpportunity {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
        #[serde(default)]
        message_id: Option<String>,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    /// Any `type` this client does not know.
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::ConnectionAck { .. } => "connection_ack",
            InboundEvent::TypingStart => "typing_start",
            InboundEvent::TypingStop => "typing_stop",
            InboundEvent::StreamStart { .. } => "stream_start",
            InboundEvent::StreamToken { .. } => "stream_token",
            InboundEvent::StreamComplete { .. } => "stream_complete",
            InboundEvent::Message { .. } => "message",
            InboundEvent::OptimizationResult { .. } => "optimization_result",
            InboundEvent::TemplateOpportunity { .. } => "template_opportunity",
            InboundEvent::Error { .. } => "error",
            InboundEvent::Heartbeat { .. } => "heartbeat",
            InboundEvent::Pong { .. } => "pong",
            InboundEvent::Unknown => "unknown",
        }
    }
}

// -- Outbound frames ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ChatMessage {
        message: String,
    },
    SlashCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
    SaveConversationAsTemplate {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    CreateTemplate {
        title: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::ChatMessage { .. } => "chat_message",
            OutboundFrame::SlashCommand { .. } => "slash_command",
            OutboundFrame::Ping { .. } => "ping",
            OutboundFrame::SaveConversationAsTemplate { .. } => "save_conversation_as_template",
            OutboundFrame::CreateTemplate { .. } => "create_template",
        }
    }
}

// -- SSE completion request --------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Body of `POST /api/v2/chat/completions/`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatTurn>,
    pub model: String,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub session_id: String,
}
