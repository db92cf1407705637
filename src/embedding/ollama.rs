//! Ollama-served embeddings via `POST {endpoint}/api/embeddings`

use crate::embedding::{Embedder, EmbeddingError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Thin client for one Ollama embedding model
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, EmbeddingError> {
        let endpoint = endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(EmbeddingError::InitializationError(format!(
                "invalid Ollama endpoint: {}",
                endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/api/embeddings", endpoint.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }

        debug!("POST {}", self.url);
        let resp = self
            .client
            .post(&self.url)
            .json(&EmbeddingsRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let snippet = body.chars().take(240).collect::<String>();
            return Err(EmbeddingError::GenerationError(format!(
                "HTTP {} from {}: {}",
                status, self.url, snippet
            )));
        }

        let out: EmbeddingsResponse = resp.json().await.map_err(|e| {
            EmbeddingError::GenerationError(format!("expected `{{ embedding: number[] }}`: {e}"))
        })?;

        if out.embedding.is_empty() {
            return Err(EmbeddingError::GenerationError(
                "No embeddings generated".to_string(),
            ));
        }

        Ok(out.embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
