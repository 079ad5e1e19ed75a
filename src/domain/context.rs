//! Conversation context domain types.
//!
//! Optional explanatory record accompanying a transaction: the conversation
//! that led to it, where the request came from, and any tool calls in the
//! chain. The context analyzer stage consumes this to detect prompt
//! injection and social-engineering signals.

use serde::{Deserialize, Serialize};

/// Role tag of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Kind of actor that originated the transaction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    User,
    Assistant,
    Tool,
    Unknown,
}

/// How much the originating source is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    High,
    Medium,
    Low,
    Untrusted,
}

/// Descriptor of the request's origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Human-readable identifier (agent name, tool name, user handle).
    pub identifier: String,
    pub trust: TrustLevel,
}

/// One entry of the tool-call chain that preceded the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub output: String,
}

/// Explanatory record for a transaction under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Ordered conversation, oldest first.
    pub messages: Vec<Message>,
    pub source: ContextSource,
    /// Ordered tool-call chain, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ConversationContext {
    /// Context from a user-originated conversation with full trust.
    pub fn from_user(identifier: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            source: ContextSource {
                source_type: SourceType::User,
                identifier: identifier.into(),
                trust: TrustLevel::High,
            },
            tool_calls: Vec::new(),
        }
    }

    /// Attach a tool-call chain.
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}
