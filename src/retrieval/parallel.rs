use crate::index::{IndexRegistry, RetrievedChunk};
use crate::retrieval::{ErrorKind, QueryError};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

/// Results of one index, best first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedList {
    pub index_key: String,
    pub chunks: Vec<RetrievedChunk>,
}

/// An index that could not answer this request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexFailure {
    pub index_key: String,
    pub message: String,
}

/// Every index's answer, in registry order
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalOutcome {
    pub lists: Vec<RankedList>,
    pub failures: Vec<IndexFailure>,
}

impl RetrievalOutcome {
    pub fn candidate_count(&self) -> usize {
        self.lists.iter().map(|l| l.chunks.len()).sum()
    }
}

/// Fans one query out to every registered index concurrently
#[derive(Clone)]
pub struct ParallelRetriever {
    registry: IndexRegistry,
    top_k: usize,
}

impl ParallelRetriever {
    pub fn new(registry: IndexRegistry, top_k: usize) -> Self {
        Self { registry, top_k }
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Search all indices and wait for every one of them
    ///
    /// Failed indices are logged and skipped. Only when none succeeds does
    /// the request fail.
    pub async fn retrieve(
        &self,
        query: &str,
        category: Option<&str>,
    ) -> Result<RetrievalOutcome, QueryError> {
        if self.registry.is_empty() {
            return Err(QueryError::NoIndices);
        }

        let searches = self.registry.handles().iter().map(|handle| async move {
            let result = handle.store.search(query, self.top_k, category).await;
            (handle.key.clone(), result)
        });

        let mut outcome = RetrievalOutcome::default();
        for (index_key, result) in join_all(searches).await {
            match result {
                Ok(chunks) => {
                    debug!(index = %index_key, hits = chunks.len(), "Index answered");
                    outcome.lists.push(RankedList { index_key, chunks });
                }
                Err(e) => {
                    warn!(
                        kind = %ErrorKind::IndexUnavailable,
                        index = %index_key,
                        error = %e,
                        "Index search failed, continuing without it"
                    );
                    outcome.failures.push(IndexFailure {
                        index_key,
                        message: e.to_string(),
                    });
                }
            }
        }

        if outcome.lists.is_empty() {
            return Err(QueryError::AllIndexesFailed {
                failures: outcome.failures,
            });
        }

        Ok(outcome)
    }
}
