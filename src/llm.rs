//! LLM call layer used by the enrichment and generation work units.
//!
//! The orchestrator never sees this module: workers depend on the
//! [`LlmClient`] trait and report provider, model and token usage through
//! phase metadata.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::LlmError;

/// A single completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON object response.
    pub json: bool,
}

impl LlmRequest {
    pub fn json(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 2048,
            temperature: 0.2,
            json: true,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token accounting as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

impl LlmResponse {
    /// Parse the completion as a JSON value, tolerating a Markdown code fence.
    pub fn json_value(&self) -> Result<Value, LlmError> {
        serde_json::from_str(strip_code_fence(&self.content))
            .map_err(|e| LlmError::InvalidResponse(format!("expected JSON: {}", e)))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpLlmClient {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        if base_url.trim().is_empty() {
            return Err(LlmError::NotConfigured);
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::Request(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(String::from),
            model: model.to_string(),
        })
    }

    fn headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| LlmError::Request("API key is not a valid header value".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn request_body(&self, request: &LlmRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if request.json {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

fn parse_chat_response(body: &str, fallback_model: &str) -> Result<LlmResponse, LlmError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::InvalidResponse(format!("malformed completion: {}", e)))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| LlmError::InvalidResponse("completion had no content".into()))?;
    Ok(LlmResponse {
        content,
        model: parsed.model.unwrap_or_else(|| fallback_model.to_string()),
        usage: parsed.usage,
    })
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn provider(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(model = %self.model, json = request.json, "LLM completion request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        let parsed = parse_chat_response(&text, &self.model)?;
        tracing::debug!(
            model = %parsed.model,
            total_tokens = parsed.usage.total_tokens,
            "LLM completion received"
        );
        Ok(parsed)
    }
}
