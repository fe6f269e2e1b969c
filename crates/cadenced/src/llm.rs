//! The chat-model contract the executor drives.
//!
//! A `ChatModel` turns a message dialogue into one assistant reply that may
//! carry tool calls. Binding tool schemas produces a derived model; the
//! binding is stable for the life of the derived value.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadence_core::TokenUsage;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{provider}: request failed: {reason}")]
    Request { provider: String, reason: String },
    #[error("{provider}: authentication failed")]
    Auth { provider: String },
    #[error("{provider}: invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
    #[error("unsupported llm provider: {0:?} (supported: anthropic, openai, ollama)")]
    UnsupportedProvider(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// Schema of one tool as presented to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments object.
    pub parameters: serde_json::Value,
}

/// Dialogue roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool call requested by an assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id; may be empty for providers that omit one.
    pub id: String,
    pub name: String,
    /// Raw argument payload as the model produced it. Not guaranteed to be
    /// valid JSON.
    pub arguments: String,
}

/// One message in the dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` messages: the assistant tool call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Provider-reported usage, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            usage: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            usage: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            usage: None,
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            usage: None,
        }
    }
}

/// A tool-calling chat model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce one assistant reply for the dialogue.
    async fn generate(&self, messages: &[Message]) -> Result<Message>;

    /// Derive a model aware of the supplied tool schemas.
    fn with_tools(&self, tools: &[ToolSpec]) -> Arc<dyn ChatModel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);

        let tool = Message::tool("{\"ok\":true}", "call-1");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn message_json_omits_empty_tool_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
        assert!(json.get("usage").is_none());
    }
}
