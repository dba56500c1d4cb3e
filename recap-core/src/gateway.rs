//! Model gateway: talks to the external chat model.
//!
//! `ModelGateway::call_chat` never fails. For each candidate base it tries a
//! chat-completions call, then a legacy text-generation call; the whole base
//! list is retried for `retry_rounds` passes with doubling backoff between
//! passes. Missing credentials or total exhaustion yield a deterministic
//! local reply so the pipeline keeps working offline.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::backoff;
use crate::config::ModelConfig;
use crate::parser;
use crate::prompt::{self, ChatMessage, Role};

/// Characters of an error body kept in `GatewayError::Api`.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Field names that may carry generated text in a legacy reply object.
const LEGACY_TEXT_FIELDS: &[&str] = &[
    "generated_text",
    "text",
    "output",
    "completion",
    "summary_text",
    "response",
];

// ============================================================================
// ChatModel trait
// ============================================================================

/// Abstraction over anything that can answer a chat prompt.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Always returns usable, non-empty text.
    async fn call_chat(&self, model: &str, messages: &[ChatMessage], options: &CallOptions)
        -> String;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-attempt deadline. A timed-out attempt counts as a failed attempt.
    pub timeout_ms: u64,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 800,
            timeout_ms: 120_000,
        }
    }
}

impl From<&ModelConfig> for CallOptions {
    fn from(config: &ModelConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_ms: config.timeout_ms,
        }
    }
}

// ============================================================================
// Error types
// ============================================================================

/// Per-attempt failures. Logged, never returned from `call_chat`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Reply had no usable text")]
    EmptyReply,
}

impl GatewayError {
    fn from_reqwest(e: reqwest::Error, timeout_ms: u64) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout(timeout_ms)
        } else {
            GatewayError::Http(e)
        }
    }
}

// ============================================================================
// Reply shapes
// ============================================================================

/// Every reply shape the gateway accepts, resolved once by `from_body`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ModelReply {
    Chat(ChatCompletion),
    LegacyArray(Vec<LegacyGeneration>),
    LegacyObject(LegacyGeneration),
    PlainString(String),
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct LegacyGeneration(Map<String, Value>);

impl LegacyGeneration {
    fn text(&self) -> Option<String> {
        LEGACY_TEXT_FIELDS
            .iter()
            .find_map(|field| self.0.get(*field).and_then(Value::as_str))
            .map(str::to_string)
    }
}

impl ModelReply {
    /// Chat-completions endpoints must answer with a `choices` object;
    /// anything else is treated as no reply.
    pub fn from_chat_body(body: &str) -> Option<Self> {
        serde_json::from_str::<ChatCompletion>(body)
            .ok()
            .map(ModelReply::Chat)
    }

    /// Legacy generation bodies. Non-JSON bodies are taken as plain text.
    pub fn from_body(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| ModelReply::PlainString(body.to_string()))
    }

    /// The generated text, if any non-blank text is present.
    pub fn text(&self) -> Option<String> {
        let text = match self {
            ModelReply::Chat(completion) => completion.choices.first().and_then(|choice| {
                let from_message = choice
                    .message
                    .as_ref()
                    .and_then(|m| m.content.as_ref())
                    .map(|content| match content {
                        MessageContent::Text(s) => s.clone(),
                        MessageContent::Parts(parts) => parts
                            .iter()
                            .filter_map(|p| p.text.as_deref())
                            .collect::<Vec<_>>()
                            .join(""),
                    })
                    .filter(|s| !s.trim().is_empty());
                from_message.or_else(|| choice.text.clone())
            }),
            ModelReply::LegacyArray(items) => items.first().and_then(LegacyGeneration::text),
            ModelReply::LegacyObject(item) => item.text(),
            ModelReply::PlainString(s) => Some(s.clone()),
        }?;

        (!text.trim().is_empty()).then_some(text)
    }
}

/// Strip fences and keep the brace-delimited part when there is one.
pub fn clean_reply(text: &str) -> String {
    let stripped = parser::strip_fences(text);
    let trimmed = stripped.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => trimmed[start..=end].to_string(),
        _ => trimmed.to_string(),
    }
}

// ============================================================================
// Local fallback
// ============================================================================

/// Deterministic canned reply in the canonical JSON shape. The template is
/// picked from the opening line of the user prompt.
pub fn fallback_reply(messages: &[ChatMessage]) -> String {
    let is_trade = messages
        .iter()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.lines().next())
        .is_some_and(|opening| opening.trim() == prompt::TRADE_OPENING);

    let reply = if is_trade {
        serde_json::json!({
            "summaryText": "Trade analysis (fallback). The analysis service was unavailable, so this is a generic review of the trade.",
            "plusPoints": ["The trade was recorded with its entry and exit details."],
            "minusPoints": [],
            "aiSuggestions": [
                "Compare the entry and exit against your written plan.",
                "Regenerate this analysis once the service is available."
            ]
        })
    } else {
        serde_json::json!({
            "summaryText": "Summary (fallback). The analysis service was unavailable, so this is a generic review of the period.",
            "plusPoints": ["Trades for the period were recorded."],
            "minusPoints": [],
            "aiSuggestions": [
                "Review your largest loss and largest win for repeatable patterns.",
                "Regenerate this summary once the service is available."
            ]
        })
    };

    reply.to_string()
}

// ============================================================================
// ModelGateway
// ============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: Option<String>,
    /// Configured base first, then alternates. De-duplicated at call time.
    pub bases: Vec<String>,
    pub retry_rounds: usize,
    pub backoff_base_ms: u64,
}

impl GatewayConfig {
    pub fn from_model_config(config: &ModelConfig) -> Self {
        let mut bases = vec![config.base_url.clone()];
        bases.extend(config.alternate_bases.iter().cloned());
        Self {
            api_key: config.resolve_api_key(),
            bases,
            retry_rounds: config.retry_rounds,
            backoff_base_ms: config.backoff_base_ms,
        }
    }
}

/// HTTP gateway with multi-base fallback. Cheap to clone; share one per process.
#[derive(Debug, Clone)]
pub struct ModelGateway {
    client: Client,
    config: GatewayConfig,
}

impl ModelGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder().build()?;
        Ok(Self { client, config })
    }

    /// Ordered, de-duplicated, trailing-slash-free bases.
    pub fn candidate_bases(&self) -> Vec<String> {
        let mut bases: Vec<String> = Vec::new();
        for base in &self.config.bases {
            let base = base.trim().trim_end_matches('/');
            if !base.is_empty() && !bases.iter().any(|b| b == base) {
                bases.push(base.to_string());
            }
        }
        bases
    }

    async fn attempt_base(
        &self,
        base: &str,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<String, GatewayError> {
        match self.chat_completion(base, api_key, model, messages, options).await {
            Ok(text) => return Ok(text),
            Err(e) => {
                tracing::debug!(base, error = %e, "Chat-style call failed, trying legacy generation");
            }
        }
        self.legacy_generation(base, api_key, model, messages, options)
            .await
    }

    async fn chat_completion(
        &self,
        base: &str,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<String, GatewayError> {
        let url = format!("{base}/chat/completions");
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": false,
        });
        let text = self.post(&url, api_key, &body, options).await?;
        reply_text(ModelReply::from_chat_body(&text).ok_or(GatewayError::EmptyReply)?)
    }

    async fn legacy_generation(
        &self,
        base: &str,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<String, GatewayError> {
        let url = format!("{base}/models/{model}");
        let body = serde_json::json!({
            "inputs": flatten_messages(messages),
            "parameters": {
                "temperature": options.temperature,
                "max_new_tokens": options.max_tokens,
                "return_full_text": false,
            },
            "options": { "wait_for_model": true },
        });
        let text = self.post(&url, api_key, &body, options).await?;
        reply_text(ModelReply::from_body(&text))
    }

    async fn post(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
        options: &CallOptions,
    ) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .timeout(Duration::from_millis(options.timeout_ms))
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(e, options.timeout_ms))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::from_reqwest(e, options.timeout_ms))?;

        if !status.is_success() {
            return Err(GatewayError::Api {
                code: status.as_u16(),
                message: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        Ok(text)
    }
}

fn reply_text(reply: ModelReply) -> Result<String, GatewayError> {
    let text = reply.text().ok_or(GatewayError::EmptyReply)?;
    let cleaned = clean_reply(&text);
    if cleaned.is_empty() {
        return Err(GatewayError::EmptyReply);
    }
    Ok(cleaned)
}

#[async_trait]
impl ChatModel for ModelGateway {
    async fn call_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> String {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::warn!("No model API key configured, returning local fallback reply");
            return fallback_reply(messages);
        };

        let bases = self.candidate_bases();
        let rounds = self.config.retry_rounds.max(1);
        let mut delays = backoff::doubling(self.config.backoff_base_ms);
        let mut last_error: Option<GatewayError> = None;

        for round in 1..=rounds {
            if round > 1 {
                if let Some(delay) = delays.next() {
                    tokio::time::sleep(delay).await;
                }
            }

            for base in &bases {
                match self
                    .attempt_base(base, api_key, model, messages, options)
                    .await
                {
                    Ok(text) => {
                        tracing::debug!(base = %base, round, model, "Model call succeeded");
                        return text;
                    }
                    Err(e) => {
                        tracing::warn!(base = %base, round, model, error = %e, "Model call failed");
                        last_error = Some(e);
                    }
                }
            }
        }

        tracing::error!(
            rounds,
            bases = bases.len(),
            last_error = ?last_error,
            "All model endpoints failed, returning local fallback reply"
        );
        fallback_reply(messages)
    }

    fn name(&self) -> &str {
        "model-gateway"
    }
}

fn flatten_messages(messages: &[ChatMessage]) -> String {
    let mut prompt = messages
        .iter()
        .map(|m| {
            let label = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{label}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    prompt.push_str("\n\nAssistant:");
    prompt
}

// ============================================================================
// TESTS
// ============================================================================
