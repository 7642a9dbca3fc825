//! OpenAI-compatible chat and embeddings client.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ChatRequest, LlmClient, ToolSpec};
use crate::domain::error::{AppError, Result};

pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Map an HTTP failure to the error taxonomy: 429 is backpressure,
    /// 5xx and transport failures are retryable, anything else is fatal.
    async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(AppError::Busy(format!("LLM rate limited ({})", status)));
        }
        if status.is_server_error() {
            return Err(AppError::UpstreamUnavailable(format!(
                "LLM API error {} at {}: {}",
                status, url, body
            )));
        }
        Err(AppError::Internal(format!(
            "LLM API rejected request {} at {}: {}",
            status, url, body
        )))
    }

    async fn post_chat(&self, body: Value) -> Result<Value> {
        let url = self.endpoint("chat/completions");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("LLM request failed: {}", e)))?;

        let response = Self::check_status(response, &url).await?;
        response
            .json()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("Failed to parse LLM response: {}", e)))
    }

    fn messages(request: &ChatRequest) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.user }));
        messages
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let body = json!({
            "model": request.model,
            "messages": Self::messages(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self.post_chat(body).await?;
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| AppError::Internal("Invalid chat response format".to_string()))
    }

    async fn chat_with_tool(&self, request: &ChatRequest, tool: &ToolSpec) -> Result<Value> {
        let body = json!({
            "model": request.model,
            "messages": Self::messages(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "tools": [{
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            }],
            "tool_choice": {
                "type": "function",
                "function": { "name": tool.name }
            },
        });

        let response = self.post_chat(body).await?;
        let arguments = response["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .ok_or_else(|| AppError::Internal("Missing tool call in chat response".to_string()))?;

        serde_json::from_str(arguments)
            .map_err(|e| AppError::Internal(format!("Invalid tool call arguments: {}", e)))
    }

    async fn embed(&self, model: &str, input: &str) -> Result<Vec<f32>> {
        let url = self.endpoint("embeddings");
        let body = json!({ "model": model, "input": input });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("Embedding request failed: {}", e)))?;

        let response = Self::check_status(response, &url).await?;
        let parsed: Value = response.json().await.map_err(|e| {
            AppError::UpstreamUnavailable(format!("Failed to parse embedding response: {}", e))
        })?;

        let embedding: Vec<f32> = parsed["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| AppError::Internal("No embedding data in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.is_empty() {
            return Err(AppError::Internal("Empty embedding response".to_string()));
        }

        Ok(embedding)
    }
}
