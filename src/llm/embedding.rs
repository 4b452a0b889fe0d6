//! Embedding services mapping text to fixed-length vectors.

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::info;

use super::{LlmSettings, ServiceError};

/// Text embedding service.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed `text` into a vector of the service's fixed dimension.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}

/// Cosine similarity of two vectors; 0.0 when either is all zeros.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Local embedding model run through `fastembed`.
pub struct FastEmbedService {
    model: Arc<Mutex<Option<TextEmbedding>>>,
    model_kind: EmbeddingModel,
}

impl std::fmt::Debug for FastEmbedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedService")
            .field("model", &self.model_kind)
            .finish()
    }
}

impl FastEmbedService {
    /// Create a service for the named model. Unknown names fall back to BGE small.
    #[must_use]
    pub fn new(model_name: &str) -> Self {
        let model_kind = match model_name.to_lowercase().as_str() {
            "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
            "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            _ => EmbeddingModel::BGESmallENV15,
        };
        Self {
            model: Arc::new(Mutex::new(None)),
            model_kind,
        }
    }

    /// Load the model weights. Must run before the first [`EmbeddingService::embed`].
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let mut model_guard = self.model.lock().await;
        if model_guard.is_none() {
            info!(model = ?self.model_kind, "Initializing fastembed model...");
            let mut options = InitOptions::new(self.model_kind.clone());
            options.show_download_progress = true;

            let model =
                tokio::task::spawn_blocking(move || TextEmbedding::try_new(options)).await??;
            *model_guard = Some(model);
        }
        Ok(())
    }
}

/// Run `f` against the model in the blocking pool.
///
/// The lock guard moves into the blocking task, so the model stays in its slot
/// and the lock is released by that task even if the caller stops waiting.
async fn with_model<M, R, F>(slot: &Arc<Mutex<Option<M>>>, f: F) -> Result<R, ServiceError>
where
    M: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut M) -> R + Send + 'static,
{
    let guard = Arc::clone(slot).lock_owned().await;
    if guard.is_none() {
        return Err(ServiceError::Unavailable(
            "embedding model not initialized".to_string(),
        ));
    }

    tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        guard.as_mut().map(f)
    })
    .await
    .map_err(|e| ServiceError::Unavailable(format!("embedding task failed: {e}")))?
    .ok_or_else(|| ServiceError::Unavailable("embedding model not initialized".to_string()))
}

#[async_trait]
impl EmbeddingService for FastEmbedService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let texts = vec![text.to_string()];
        with_model(&self.model, move |model| model.embed(texts, None))
            .await?
            .map_err(|e| ServiceError::Malformed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Malformed("no embedding generated".to_string()))
    }
}

/// Remote embedding service speaking the `OpenAI` `/v1/embeddings` API.
#[derive(Clone)]
pub struct OpenAiEmbeddingService {
    http: reqwest::Client,
    settings: LlmSettings,
    model: String,
}

impl std::fmt::Debug for OpenAiEmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddingService")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiEmbeddingService {
    #[must_use]
    pub fn new(settings: LlmSettings, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let url = self
            .settings
            .provider
            .build_embeddings_url(&self.settings.base_url);
        let body = json!({ "model": self.model, "input": text });

        let rb = self.http.post(&url).json(&body);
        let rb = self
            .settings
            .provider
            .authorize(rb, self.settings.api_key.as_deref());

        let resp = rb.send().await?.error_for_status()?;
        let v: Value = resp.json().await?;
        parse_embedding(&v)
    }
}

fn parse_embedding(v: &Value) -> Result<Vec<f32>, ServiceError> {
    let arr = v["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| ServiceError::Malformed("response has no embedding".to_string()))?;

    arr.iter()
        .map(|x| {
            x.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ServiceError::Malformed("non-numeric embedding value".to_string()))
        })
        .collect()
}
