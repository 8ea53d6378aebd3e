//! Completion collaborator.
//!
//! A [`CompletionClient`] turns document text plus a [`SchemaHandle`] into
//! a JSON value. Two HTTP backends are provided:
//!
//! - **[`OpenAiClient`]** calls `POST {url}/v1/chat/completions`.
//! - **[`OllamaClient`]** calls `POST {url}/api/chat` on a local Ollama.
//!
//! Clients make exactly one request per call. Retrying, rate limiting, and
//! checking the reply against the schema are the structuring engine's job;
//! [`CompletionError::is_retryable`] and [`backoff_delay`] give it the policy:
//!
//! - HTTP 429, 5xx, timeouts, and network errors → retry
//! - other HTTP errors and malformed replies → fail immediately
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::CompletionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::schema::SchemaHandle;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You extract structured data from documents according to a provided schema. \
Return JSON matching the schema structure exactly: never return an object when an array is requested, \
or an array when an object is requested. Only use information present in the document.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by the completion service")]
    RateLimited,

    #[error("completion API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed completion output: {0}")]
    Malformed(String),

    #[error("completion request timed out")]
    Timeout,

    #[error("completion provider is disabled")]
    Disabled,

    #[error("completion calls were cancelled")]
    Cancelled,
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Network(_) | CompletionError::RateLimited | CompletionError::Timeout => {
                true
            }
            CompletionError::Api { status, .. } => *status >= 500,
            CompletionError::Malformed(_) | CompletionError::Disabled | CompletionError::Cancelled => {
                false
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << attempt.saturating_sub(1).min(5))
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier, for logs and the `check` command.
    fn model_name(&self) -> &str;

    /// Ask the model for a value shaped like `schema`, extracted from `text`.
    async fn complete(&self, text: &str, schema: &SchemaHandle) -> Result<Value, CompletionError>;
}

/// Build the completion client selected by `config.provider`.
///
/// A disabled provider, or the OpenAI provider without an API key, is a
/// [`PipelineError::Configuration`]: nothing can be structured.
pub fn create_client(config: &CompletionConfig) -> PipelineResult<Box<dyn CompletionClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiClient::new(config)?)),
        "ollama" => Ok(Box::new(OllamaClient::new(config)?)),
        "disabled" => Err(PipelineError::Configuration(
            "completion provider is disabled; set [completion] provider to parse documents"
                .to_string(),
        )),
        other => Err(PipelineError::Configuration(format!(
            "unknown completion provider: {}",
            other
        ))),
    }
}

fn http_client(config: &CompletionConfig) -> PipelineResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| PipelineError::Configuration(format!("cannot build HTTP client: {}", e)))
}

/// The user message: schema fields, document text, and the expected root.
pub fn build_user_prompt(text: &str, schema: &SchemaHandle) -> String {
    let fields =
        serde_json::to_string_pretty(schema.prompt_fields()).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Extract structured data from the document below.\n\n\
         Schema:\n{fields}\n\n\
         Document text:\n{text}\n\n\
         Extract all available data according to the schema. Return as JSON {kind}.\n\
         Do not invent data that is not in the document to fill fields required by the schema.",
        fields = fields,
        text = text,
        kind = schema.root_kind()
    )
}

/// Turn the model's reply text into JSON.
///
/// Accepts replies wrapped in a Markdown code fence. When the schema wants
/// an array and the model wrapped it in a single-key object, the array is
/// unwrapped.
pub fn parse_reply(reply: &str, schema: &SchemaHandle) -> Result<Value, CompletionError> {
    let body = strip_code_fence(reply);
    if body.is_empty() {
        return Err(CompletionError::Malformed("empty reply".to_string()));
    }

    let value: Value =
        serde_json::from_str(body).map_err(|e| CompletionError::Malformed(e.to_string()))?;

    if schema.root_kind() == "array" {
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(Value::Array(items)) = map.values().next() {
                    return Ok(Value::Array(items.clone()));
                }
            }
        }
    }

    Ok(value)
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.rfind("```") {
        Some(end) => &rest[..end],
        None => rest,
    };
    // A first line holding only an info string (```json) is dropped; a
    // one-line fence may carry a `json` tag directly before the body.
    match rest.split_once('\n') {
        Some((tag, body)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => body.trim(),
        _ => rest.strip_prefix("json").unwrap_or(rest).trim(),
    }
}

fn map_send_error(e: reqwest::Error) -> CompletionError {
    if e.is_timeout() {
        CompletionError::Timeout
    } else {
        CompletionError::Network(e.to_string())
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, CompletionError> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(CompletionError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(500).collect();
        return Err(CompletionError::Api {
            status: status.as_u16(),
            message,
        });
    }
    response.json().await.map_err(|e| {
        if e.is_timeout() {
            CompletionError::Timeout
        } else {
            CompletionError::Malformed(e.to_string())
        }
    })
}

// ============ OpenAI ============

pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f32,
    system_prompt: String,
}

impl OpenAiClient {
    pub fn new(config: &CompletionConfig) -> PipelineResult<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            PipelineError::Configuration(format!(
                "{} is not set; the openai completion provider needs an API key",
                config.api_key_env
            ))
        })?;

        Ok(Self {
            http: http_client(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            model: config.model_name().to_string(),
            api_key,
            temperature: config.temperature,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }

    fn request_body(&self, text: &str, schema: &SchemaHandle) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {"role": "user", "content": build_user_prompt(text, schema)},
            ],
        });
        // JSON mode only produces objects.
        if schema.root_kind() == "object" {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, text: &str, schema: &SchemaHandle) -> Result<Value, CompletionError> {
        debug!(model = %self.model, schema = %schema.name, chars = text.len(), "openai completion");

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(text, schema))
            .send()
            .await
            .map_err(map_send_error)?;

        let json = read_json(response).await?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                CompletionError::Malformed("response has no choices[0].message.content".to_string())
            })?;

        parse_reply(content, schema)
    }
}

// ============ Ollama ============

pub struct OllamaClient {
    http: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    system_prompt: String,
}

impl OllamaClient {
    pub fn new(config: &CompletionConfig) -> PipelineResult<Self> {
        let model = config.model.clone().ok_or_else(|| {
            PipelineError::Configuration(
                "completion.model required for the ollama provider".to_string(),
            )
        })?;

        Ok(Self {
            http: http_client(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            model,
            temperature: config.temperature,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }

    fn request_body(&self, text: &str, schema: &SchemaHandle) -> Value {
        json!({
            "model": self.model,
            "stream": false,
            "format": schema.definition.as_ref(),
            "options": {"temperature": self.temperature},
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {"role": "user", "content": build_user_prompt(text, schema)},
            ],
        })
    }
}

#[async_trait]
impl CompletionClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, text: &str, schema: &SchemaHandle) -> Result<Value, CompletionError> {
        debug!(model = %self.model, schema = %schema.name, chars = text.len(), "ollama completion");

        let response = self
            .http
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&self.request_body(text, schema))
            .send()
            .await
            .map_err(|e| match map_send_error(e) {
                CompletionError::Network(msg) => CompletionError::Network(format!(
                    "is Ollama running at {}? {}",
                    self.url, msg
                )),
                other => other,
            })?;

        let json = read_json(response).await?;
        let content = json
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| CompletionError::Malformed("response has no message.content".to_string()))?;

        parse_reply(content, schema)
    }
}
