use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::models::RetryPolicy;

/// Name of the env var read for the model credential when `api_key_env` is unset.
pub const DEFAULT_API_KEY_ENV: &str = "MODEL_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct RecapConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub alternate_bases: Vec<String>,
    pub default_model: String,
    /// Plaintext credential. Prefer `api_key_env`.
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    /// Total passes over the base list, including the first one.
    pub retry_rounds: usize,
    pub backoff_base_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://router.huggingface.co/v1".to_string(),
            alternate_bases: vec![
                "https://router.huggingface.co/hf-inference".to_string(),
                "https://api-inference.huggingface.co".to_string(),
            ],
            default_model: "meta-llama/Llama-3.1-8B-Instruct".to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            temperature: 0.2,
            max_tokens: 800,
            timeout_ms: 120_000,
            retry_rounds: 3,
            backoff_base_ms: 500,
        }
    }
}

impl ModelConfig {
    /// Resolve the credential: plaintext `api_key` first, then the env var.
    /// Blank values count as missing.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            tracing::warn!(
                "Model API key loaded from plaintext config field 'api_key'; prefer 'api_key_env'"
            );
            return Some(key.clone());
        }

        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub attempts: u32,
    pub backoff_base_ms: u64,
    /// Backlog depth at or above which requests skip the inline path.
    pub inline_threshold: u64,
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// An active job not finished within this window is handed out again.
    pub lease_ms: u64,
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.attempts, self.backoff_base_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base_ms: 2000,
            inline_threshold: 5,
            workers: 2,
            poll_interval_ms: 1000,
            lease_ms: 600_000,
        }
    }
}

/// What a record becomes when the model reply cannot be parsed at all.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    /// Store fallback text and mark the record `ready`.
    #[default]
    Ready,
    /// Mark the record `failed`, keeping the raw response.
    Failed,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub on_parse_failure: ParseFailurePolicy,
}

impl RecapConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("RECAP").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
