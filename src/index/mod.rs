//! Read-only vector indices, one per embedding strategy
//!
//! Each index answers `search(query, k)` with chunks in rank order. The
//! registry owns one handle per configured index and is shared by every
//! request.

mod registry;
mod snapshot;

pub use registry::{IndexHandle, IndexRegistry};
pub use snapshot::{SnapshotIndex, SNAPSHOT_FILE};

use crate::embedding::{EmbeddingError, VectorIndexError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Category assigned to chunks ingested without one
pub const DEFAULT_CATEGORY: &str = "general";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to read snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Snapshot {path} line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Duplicate chunk id in snapshot: {0}")]
    DuplicateChunk(String),

    #[error("Query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector search failed: {0}")]
    Vector(#[from] VectorIndexError),

    #[error("Search task failed: {0}")]
    Task(String),
}

/// A retrievable unit of source text as returned by one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Stable identifier, `<source_path>::<sequence>` unless ingestion set one
    pub chunk_id: String,
    pub text: String,
    pub source_path: String,
    pub category: String,
    /// Key of the index that produced this chunk
    pub index_key: String,
}

impl RetrievedChunk {
    /// Whether this chunk belongs to `category` (case-insensitive)
    pub fn in_category(&self, category: &str) -> bool {
        self.category.eq_ignore_ascii_case(category.trim())
    }
}

/// Similarity search over one persisted index
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Top-`k` chunks for `query`, best first
    ///
    /// With `category` set only chunks of that category are returned.
    async fn search(
        &self,
        query: &str,
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<RetrievedChunk>, IndexError>;

    /// Make sure the index is loaded and report how many chunks it holds
    async fn ensure_loaded(&self) -> Result<usize, IndexError> {
        Ok(0)
    }
}
