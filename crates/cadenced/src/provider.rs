//! LLM provider clients.
//!
//! `anthropic` speaks the Messages API; `openai` and `ollama` share the
//! OpenAI-compatible chat-completions wire format (ollama serves it locally
//! and needs no API key).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use cadence_core::config::LlmConfig;
use cadence_core::TokenUsage;

use crate::llm::{ChatModel, LlmError, Message, Result, Role, ToolCall, ToolSpec};

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Build a chat model from the `llm` config section.
pub fn new_chat_model(cfg: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicModel::new(cfg))),
        "openai" => Ok(Arc::new(OpenAiCompatModel::new(
            "openai",
            cfg.base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            cfg.api_key.clone(),
            cfg.model.clone(),
            cfg.max_tokens,
        ))),
        "ollama" => Ok(Arc::new(OpenAiCompatModel::new(
            "ollama",
            cfg.base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            cfg.api_key.clone(),
            cfg.model.clone(),
            cfg.max_tokens,
        ))),
        other => Err(LlmError::UnsupportedProvider(other.to_string())),
    }
}

fn http_client() -> Client {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn request_error(provider: &str, e: impl std::fmt::Display) -> LlmError {
    LlmError::Request {
        provider: provider.to_string(),
        reason: e.to_string(),
    }
}

fn invalid_response(provider: &str, reason: impl Into<String>) -> LlmError {
    LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: reason.into(),
    }
}

// --- Anthropic Messages API ---

#[derive(Clone)]
struct AnthropicModel {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    tools: Vec<ToolSpec>,
}

impl AnthropicModel {
    fn new(cfg: &LlmConfig) -> Self {
        Self {
            client: http_client(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            max_tokens: cfg.max_tokens,
            tools: Vec::new(),
        }
    }

    fn build_body(&self, messages: &[Message]) -> serde_json::Value {
        let mut system_parts = Vec::new();
        let mut wire_messages = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.clone()),
                Role::User => wire_messages.push(json!({
                    "role": "user",
                    "content": msg.content,
                })),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for call in &msg.tool_calls {
                        let input: serde_json::Value =
                            serde_json::from_str(&call.arguments).unwrap_or(json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": input,
                        }));
                    }
                    wire_messages.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => wire_messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                    }],
                })),
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": wire_messages,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if !self.tools.is_empty() {
            let tools: Vec<_> = self
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl ChatModel for AnthropicModel {
    async fn generate(&self, messages: &[Message]) -> Result<Message> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&self.build_body(messages))
            .send()
            .await
            .map_err(|e| request_error("anthropic", e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() == 401 {
            return Err(LlmError::Auth {
                provider: "anthropic".to_string(),
            });
        }
        if !status.is_success() {
            return Err(request_error(
                "anthropic",
                format!("HTTP {status}: {text}"),
            ));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&text)
            .map_err(|e| invalid_response("anthropic", format!("{e}; raw: {text}")))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                AnthropicContentBlock::Text { text } => {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&text);
                }
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input.to_string(),
                    });
                }
                AnthropicContentBlock::Other => {}
            }
        }

        let usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        });

        Ok(Message {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            usage,
        })
    }

    fn with_tools(&self, tools: &[ToolSpec]) -> Arc<dyn ChatModel> {
        let mut derived = self.clone();
        derived.tools = tools.to_vec();
        Arc::new(derived)
    }
}

// --- OpenAI-compatible chat completions (openai, ollama) ---

#[derive(Clone)]
struct OpenAiCompatModel {
    provider: &'static str,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    tools: Vec<ToolSpec>,
}

impl OpenAiCompatModel {
    fn new(
        provider: &'static str,
        base_url: String,
        api_key: String,
        model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            provider,
            client: http_client(),
            base_url,
            api_key,
            model,
            max_tokens,
            tools: Vec::new(),
        }
    }

    fn build_body(&self, messages: &[Message]) -> serde_json::Value {
        let wire_messages: Vec<_> = messages.iter().map(to_chat_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": self.max_tokens,
        });
        if !self.tools.is_empty() {
            let tools: Vec<_> = self
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

fn to_chat_message(msg: &Message) -> serde_json::Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = json!({"role": role, "content": msg.content});
    if !msg.tool_calls.is_empty() {
        let calls: Vec<_> = msg
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments},
                })
            })
            .collect();
        wire["tool_calls"] = json!(calls);
    }
    if let Some(id) = &msg.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: String,
    function: ChatToolFunction,
}

#[derive(Deserialize)]
struct ChatToolFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    async fn generate(&self, messages: &[Message]) -> Result<Message> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let mut request = self.client.post(&url).json(&self.build_body(messages));
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| request_error(self.provider, e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() == 401 {
            return Err(LlmError::Auth {
                provider: self.provider.to_string(),
            });
        }
        if !status.is_success() {
            return Err(request_error(
                self.provider,
                format!("HTTP {status}: {text}"),
            ));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| invalid_response(self.provider, format!("{e}; raw: {text}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| invalid_response(self.provider, "no choices in response"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: c.function.arguments,
            })
            .collect();

        let usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(Message {
            role: Role::Assistant,
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            tool_call_id: None,
            usage,
        })
    }

    fn with_tools(&self, tools: &[ToolSpec]) -> Arc<dyn ChatModel> {
        let mut derived = self.clone();
        derived.tools = tools.to_vec();
        Arc::new(derived)
    }
}
