//! Cross-encoder reranking using FastEmbed

use crate::index::RetrievedChunk;
use crate::retrieval::FusedCandidate;
use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitializationError(String),

    #[error("Reranking failed: {0}")]
    RerankingError(String),

    #[error("Scorer returned {actual} scores for {expected} candidates")]
    ScoreCountMismatch { expected: usize, actual: usize },
}

/// Scores (query, passage) pairs; higher means more relevant
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// Return one score per passage, in passage order
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RerankError>;
}

/// A chunk with its cross-encoder relevance score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankedCandidate {
    pub chunk: RetrievedChunk,
    pub relevance_score: f32,
}

/// Reorders fused candidates by relevance and keeps the best `top_n`
#[derive(Clone)]
pub struct Reranker {
    scorer: Arc<dyn RelevanceScorer>,
    top_n: usize,
}

impl Reranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>, top_n: usize) -> Self {
        Self { scorer, top_n }
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// Score every candidate in one batch and keep the `top_n` best
    ///
    /// Equal scores keep fused order. An empty input never reaches the scorer.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<FusedCandidate>,
    ) -> Result<Vec<RerankedCandidate>, RerankError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let passages: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();
        let scores = self.scorer.score_batch(query, &passages).await?;

        if scores.len() != candidates.len() {
            return Err(RerankError::ScoreCountMismatch {
                expected: candidates.len(),
                actual: scores.len(),
            });
        }

        let mut scored: Vec<RerankedCandidate> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| RerankedCandidate {
                chunk: candidate.chunk,
                // NaN sorts last
                relevance_score: if score.is_nan() { f32::NEG_INFINITY } else { score },
            })
            .collect();

        scored.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        scored.truncate(self.top_n);

        tracing::debug!(kept = scored.len(), top_n = self.top_n, "Reranked candidates");

        Ok(scored)
    }
}

/// FastEmbed cross-encoder
pub struct FastEmbedScorer {
    model: Arc<TextRerank>,
    model_name: String,
    batch_size: usize,
}

impl FastEmbedScorer {
    /// Create a scorer with the specified model
    ///
    /// # Arguments
    /// * `model_name` - Model name (e.g., "bge-reranker-base")
    /// * `batch_size` - Pairs scored per inference batch
    pub fn new(model_name: &str, batch_size: usize) -> Result<Self, RerankError> {
        tracing::info!("Initializing reranker model: {}", model_name);

        let model = match model_name {
            "bge-reranker-base" => RerankerModel::BGERerankerBase,
            "bge-reranker-v2-m3" => RerankerModel::BGERerankerV2M3,
            "jina-reranker-v1-turbo-en" => RerankerModel::JINARerankerV1TurboEn,
            other => {
                return Err(RerankError::InitializationError(format!(
                    "Unsupported reranker model: {other}"
                )))
            }
        };

        let init_options = RerankInitOptions::new(model).with_show_download_progress(false);

        let model = TextRerank::try_new(init_options)
            .map_err(|e| RerankError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[async_trait]
impl RelevanceScorer for FastEmbedScorer {
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RerankError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let passages = passages.to_vec();
        let batch_size = self.batch_size;

        let results = tokio::task::spawn_blocking(move || {
            let documents: Vec<&str> = passages.iter().map(String::as_str).collect();
            model.rerank(query.as_str(), documents, false, Some(batch_size))
        })
        .await
        .map_err(|e| RerankError::RerankingError(e.to_string()))?
        .map_err(|e| RerankError::RerankingError(e.to_string()))?;

        // fastembed returns results sorted by score; put them back in passage order
        let mut scores = vec![f32::NEG_INFINITY; results.len()];
        for result in results {
            match scores.get_mut(result.index) {
                Some(slot) => *slot = result.score,
                None => {
                    return Err(RerankError::RerankingError(format!(
                        "result index {} out of range",
                        result.index
                    )))
                }
            }
        }

        Ok(scores)
    }
}
