pub mod openai;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::error::Result;

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A function/tool the model is forced to call, with its JSON schema.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Provider seam for chat completion, forced tool calls and embeddings.
/// Implementations must be internally thread-safe; the engine shares one
/// client across requests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Plain chat completion; returns the assistant message text.
    async fn chat(&self, request: &ChatRequest) -> Result<String>;

    /// Chat completion with a forced tool call; returns the parsed
    /// arguments object of the tool invocation.
    async fn chat_with_tool(&self, request: &ChatRequest, tool: &ToolSpec) -> Result<Value>;

    /// Text embedding with the provider's fixed dimension.
    async fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>>;
}
