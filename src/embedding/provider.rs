//! Embedder capability and the FastEmbed implementation
use crate::config::{EmbedderBackend, EmbedderConfig};
use crate::embedding::OllamaEmbedder;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Turns query text into a vector in the same space as one index
///
/// Implementations are selected once when the index is built and are never
/// swapped per call.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Build the embedder described by an index's configuration
pub fn build_embedder(
    config: &EmbedderConfig,
    default_endpoint: &str,
    timeout: Duration,
) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    match config.backend {
        EmbedderBackend::Fastembed => Ok(Arc::new(FastEmbedEmbedder::new(&config.model)?)),
        EmbedderBackend::Ollama => {
            let endpoint = config.endpoint.as_deref().unwrap_or(default_endpoint);
            Ok(Arc::new(OllamaEmbedder::new(endpoint, &config.model, timeout)?))
        }
    }
}

/// FastEmbed provider for local embedding generation
///
/// Models are downloaded on-demand to `~/.cache/huggingface/` on first use.
pub struct FastEmbedEmbedder {
    model: Arc<TextEmbedding>,
    model_name: String,
}

impl FastEmbedEmbedder {
    pub fn new(model_name: &str) -> Result<Self, EmbeddingError> {
        let embedding_model = match model_name {
            "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
            "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
            _ => {
                return Err(EmbeddingError::InitializationError(format!(
                    "Unsupported model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5",
                    model_name
                )));
            }
        };

        tracing::info!("Initializing embedding model: {}", model_name);

        let init_options = InitOptions::new(embedding_model).with_show_download_progress(false);
        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }

        // ONNX inference is CPU-bound; keep it off the async workers
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        let embeddings = tokio::task::spawn_blocking(move || model.embed(vec![text], None))
            .await
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::GenerationError("No embeddings generated".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
