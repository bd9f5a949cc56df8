//! Completion-API data model and driver abstraction.
//!
//! The [`LlmDriver`] trait has the two request shapes the orchestrator
//! needs: a bounded non-streaming completion used inside the tool loop, and
//! a token stream used once the loop settles on a final answer.

pub mod chat_completions;
pub mod orchestrator;
pub mod provider;

pub use chat_completions::ChatCompletionsDriver;
pub use orchestrator::{Orchestrator, TurnEvent};
pub use provider::Provider;

use std::time::Duration;

use futures::Stream;

use crate::error::BridgeError;

/// Completion-API connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the completion API (e.g. `https://openrouter.ai/api`).
    pub base_url: String,
    /// Optional bearer credential.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Provider type, auto-detected from `base_url`.
    pub provider: Provider,
    /// Token budget per completion request.
    pub max_tokens: u32,
    /// Bounded timeout for completion-API calls.
    pub request_timeout: Duration,
}

/// A message in a conversation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// Tool call this message answers (tool role only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls made by the assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool response.
    Tool,
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Type of tool (always "function" for now).
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// Function details in a tool call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCallFunction {
    /// Mapped function name.
    pub name: String,
    /// Arguments as a JSON string.
    pub arguments: String,
}

/// The assistant message inside a non-streaming completion response.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl CompletionMessage {
    /// Whether this completion requested any tool invocations.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// One request to the completion API.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Full conversation so far.
    pub messages: Vec<Message>,
    /// Tool descriptors in function schema format; empty means no tools.
    pub tools: Vec<serde_json::Value>,
}

/// Boxed token stream returned by the streaming path.
pub type TokenStream = std::pin::Pin<Box<dyn Stream<Item = Result<String, BridgeError>> + Send>>;

/// Trait for completion-API drivers.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Non-streaming completion with a bounded token budget.
    ///
    /// # Errors
    ///
    /// [`BridgeError::PaymentRequired`] on HTTP 402,
    /// [`BridgeError::UpstreamCompletionError`] on any other non-2xx,
    /// [`BridgeError::UpstreamUnreachable`] on transport failure.
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionMessage, BridgeError>;

    /// Streaming completion; yields text tokens until the end-of-stream
    /// sentinel.
    async fn stream_text(&self, req: CompletionRequest) -> Result<TokenStream, BridgeError>;
}

impl Message {
    /// A plain text message with the given role.
    #[must_use]
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// A tool-role message answering `tool_call_id`.
    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}
