//! Embedding service. [`Embedder`] is what the pipeline and query path call;
//! [`OllamaClient`] implements it on top of ollama-rs.

use async_trait::async_trait;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;
use thiserror::Error;

pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBED_DIM: usize = 768;
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Turns text into a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier sent with each request.
    fn model(&self) -> &str;

    /// Embed a single string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Thin wrapper around Ollama for embedding.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    inner: Ollama,
    embed_model: String,
}

impl OllamaClient {
    /// Create from URL string. Default: http://localhost:11434.
    pub fn from_url(url: &str) -> Result<Self, EmbedError> {
        let inner = Ollama::try_new(url).map_err(EmbedError::ParseUrl)?;
        Ok(Self {
            inner,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
        })
    }

    /// Set the embedding model (e.g. `nomic-embed-text`, `all-minilm`).
    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    fn model(&self) -> &str {
        &self.embed_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let req = GenerateEmbeddingsRequest::new(
            self.embed_model.clone(),
            EmbeddingsInput::Single(text.to_string()),
        );
        let res = self
            .inner
            .generate_embeddings(req)
            .await
            .map_err(EmbedError::Request)?;
        res.embeddings.into_iter().next().ok_or(EmbedError::Empty)
    }
}

/// Embeds a probe string and checks the output size against `expected`.
/// Run once before indexing so a wrong model/dimension pairing fails up front.
pub async fn probe_dimension(embedder: &dyn Embedder, expected: usize) -> Result<(), EmbedError> {
    let v = embedder.embed("dimension probe").await?;
    check_dimension(&v, expected)
}

pub(crate) fn check_dimension(vector: &[f32], expected: usize) -> Result<(), EmbedError> {
    if vector.len() != expected {
        return Err(EmbedError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("invalid Ollama URL: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("Ollama request failed: {0}")]
    Request(#[from] ollama_rs::error::OllamaError),
    #[error("embedding service returned no vector")]
    Empty,
    #[error("embedding has {actual} dimensions, collection expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding failed: {0}")]
    Other(String),
}
