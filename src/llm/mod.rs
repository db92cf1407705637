//! Language model capability: blocking completion and streamed generation

mod ollama;

pub use ollama::OllamaClient;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Invalid model endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {url}: {snippet}")]
    HttpStatus {
        status: u16,
        url: String,
        snippet: String,
    },

    #[error("Failed to decode model response: {0}")]
    Decode(String),

    #[error("Model reported an error: {0}")]
    Upstream(String),

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),
}

/// Sampling parameters for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Backend-specific compute hint; for Ollama the number of GPU layers
    pub compute_hint: Option<u32>,
}

/// Incremental, finite, non-restartable text fragments
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Single non-streamed completion
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Start a streamed generation
    ///
    /// Dropping the returned stream stops consumption and releases the
    /// underlying connection.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<FragmentStream, LlmError>;
}
