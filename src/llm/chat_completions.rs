//! `OpenAI` Chat Completions API client.
//!
//! This module implements [`CompletionService`] against the Chat Completions
//! API (`/v1/chat/completions`). The optional context is sent as the system
//! message and the prompt as the user message.

use serde_json::{Value, json};

use super::{CompletionService, LlmSettings, ServiceError};

/// Client for the `OpenAI` Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .finish()
    }
}

impl ChatCompletionsClient {
    /// Create a new client with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn build_body(&self, prompt: &str, context: Option<&str>, json_mode: bool) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(ctx) = context {
            messages.push(json!({ "role": "system", "content": ctx }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut body = json!({
            "model": self.settings.model,
            "stream": false,
            "messages": messages,
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    async fn send(&self, body: Value) -> Result<String, ServiceError> {
        let url = self
            .settings
            .provider
            .build_chat_url(&self.settings.base_url);

        let rb = self.http.post(&url).json(&body);
        let rb = self
            .settings
            .provider
            .authorize(rb, self.settings.api_key.as_deref());

        let resp = rb.send().await?.error_for_status()?;
        let v: Value = resp.json().await?;
        extract_content(&v)
    }
}

/// Pull the assistant text out of a Chat Completions response.
/// The first choice's message text, trimmed. Blank text is returned as-is so
/// callers can fall back to their own wording.
fn extract_content(v: &Value) -> Result<String, ServiceError> {
    v["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ServiceError::Malformed("completion has no message content".to_string()))
}

/// Parse model output as a JSON object, tolerating a fenced code block.
pub(crate) fn parse_json_content(content: &str) -> Result<Value, ServiceError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let v: Value = serde_json::from_str(unfenced)
        .map_err(|e| ServiceError::Malformed(format!("completion is not JSON: {e}")))?;
    if v.is_object() {
        Ok(v)
    } else {
        Err(ServiceError::Malformed(
            "completion JSON is not an object".to_string(),
        ))
    }
}

#[async_trait::async_trait]
impl CompletionService for ChatCompletionsClient {
    async fn complete(&self, prompt: &str, context: Option<&str>) -> Result<String, ServiceError> {
        self.send(self.build_body(prompt, context, false)).await
    }

    async fn complete_json(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<Value, ServiceError> {
        let content = self.send(self.build_body(prompt, context, true)).await?;
        parse_json_content(&content)
    }
}
