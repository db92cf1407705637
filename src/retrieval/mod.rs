//! Retrieval stages of the answer pipeline
//!
//! Query rewriting, parallel multi-index search, Reciprocal Rank Fusion and
//! cross-encoder reranking. Each stage hands its output to the next in rank
//! order; none of them touches shared mutable state.

mod fusion;
mod parallel;
mod reranker;
mod rewrite;

pub use fusion::{reciprocal_rank_fusion, FusedCandidate, FusionConfig, FusionError};
pub use parallel::{IndexFailure, ParallelRetriever, RankedList, RetrievalOutcome};
pub use reranker::{FastEmbedScorer, RelevanceScorer, RerankError, RerankedCandidate, Reranker};
pub use rewrite::QueryRewriter;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure taxonomy of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rewrite call failed; the original question is used instead
    RewriteFailure,
    /// One index failed; it is left out of fusion
    IndexUnavailable,
    /// Every index failed; the request aborts
    AllIndexesFailed,
    /// The relevance scorer failed; the request aborts
    RerankFailure,
    /// The answer stream broke; accumulated text is returned with a marker
    GenerationFailure,
}

impl ErrorKind {
    /// Whether this kind aborts the request
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::AllIndexesFailed | Self::RerankFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RewriteFailure => "rewrite_failure",
            Self::IndexUnavailable => "index_unavailable",
            Self::AllIndexesFailed => "all_indexes_failed",
            Self::RerankFailure => "rerank_failure",
            Self::GenerationFailure => "generation_failure",
        };
        f.write_str(name)
    }
}

/// Errors that abort a request
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("No indices are configured")]
    NoIndices,

    #[error("All {} indices failed: {}", .failures.len(), describe_failures(.failures))]
    AllIndexesFailed { failures: Vec<IndexFailure> },

    #[error("Reranking failed: {0}")]
    Rerank(#[from] RerankError),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoIndices | Self::AllIndexesFailed { .. } => ErrorKind::AllIndexesFailed,
            Self::Rerank(_) => ErrorKind::RerankFailure,
        }
    }
}

fn describe_failures(failures: &[IndexFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.index_key, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
