//! Reciprocal Rank Fusion over the ranked lists of every index

use crate::index::RetrievedChunk;
use crate::retrieval::RankedList;
use ahash::AHashMap;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Invalid RRF constant {0}: must be a positive number")]
    InvalidConstant(f32),
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// RRF K constant (typically 60)
    pub rrf_k: f32,
}

impl FusionConfig {
    pub fn new(rrf_k: f32) -> Result<Self, FusionError> {
        if !rrf_k.is_finite() || rrf_k <= 0.0 {
            return Err(FusionError::InvalidConstant(rrf_k));
        }
        Ok(Self { rrf_k })
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { rrf_k: 60.0 }
    }
}

/// A chunk with its fused score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedCandidate {
    pub chunk: RetrievedChunk,
    pub fused_score: f64,
}

/// Apply Reciprocal Rank Fusion to any number of ranked lists
///
/// RRF formula: score(id) = sum over every appearance of 1 / (k + rank),
/// with `rank` starting at 0.
///
/// Output holds each `chunk_id` once, sorted by fused score descending. Equal
/// scores keep first-appearance order: earlier list first, then lower rank
/// within it. The payload of that first appearance is the one kept.
pub fn reciprocal_rank_fusion(lists: &[RankedList], config: &FusionConfig) -> Vec<FusedCandidate> {
    let k = f64::from(config.rrf_k);
    let mut positions: AHashMap<&str, usize> = AHashMap::new();
    let mut fused: Vec<FusedCandidate> = Vec::new();

    for list in lists {
        for (rank, chunk) in list.chunks.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64);
            match positions.get(chunk.chunk_id.as_str()) {
                Some(&pos) => fused[pos].fused_score += contribution,
                None => {
                    positions.insert(chunk.chunk_id.as_str(), fused.len());
                    fused.push(FusedCandidate {
                        chunk: chunk.clone(),
                        fused_score: contribution,
                    });
                }
            }
        }
    }

    // Stable sort, so ties stay in first-appearance order
    fused.sort_by(|a, b| b.fused_score.total_cmp(&a.fused_score));

    tracing::debug!(
        lists = lists.len(),
        candidates = fused.len(),
        "Fused ranked lists"
    );

    fused
}
