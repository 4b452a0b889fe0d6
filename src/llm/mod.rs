//! Clients for the completion and embedding services.
//!
//! The wizard only sees two narrow traits:
//!
//! - [`CompletionService`]: prompt + optional context in, text or JSON out
//! - [`EmbeddingService`]: text in, fixed-length vector out
//!
//! # Implementations
//!
//! - [`ChatCompletionsClient`]: `OpenAI`-compatible `/v1/chat/completions`
//! - [`FastEmbedService`]: local `fastembed` model
//! - [`OpenAiEmbeddingService`]: `OpenAI`-compatible `/v1/embeddings`

pub mod chat_completions;
pub mod embedding;
pub mod provider;
pub mod tokens;

pub use chat_completions::ChatCompletionsClient;
pub use embedding::{EmbeddingService, FastEmbedService, OpenAiEmbeddingService};
pub use provider::Provider;

/// LLM connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier used for completions.
    pub model: String,
    /// Provider type (auto-detected from `base_url` if not specified).
    pub provider: Provider,
}

/// Failure talking to an external model service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Timeout, connection failure, 429 or 5xx. Worth retrying.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    /// The service answered with something unusable.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        let retryable_status = err
            .status()
            .is_some_and(|s| s.is_server_error() || s.as_u16() == 429);
        if err.is_timeout() || err.is_connect() || retryable_status {
            Self::Unavailable(err.to_string())
        } else {
            Self::Malformed(err.to_string())
        }
    }
}

/// Text generation service.
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    /// Generate free-form text for `prompt`, optionally grounded by `context`.
    async fn complete(&self, prompt: &str, context: Option<&str>) -> Result<String, ServiceError>;

    /// Generate a JSON object for `prompt`, optionally grounded by `context`.
    async fn complete_json(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<serde_json::Value, ServiceError>;
}
