//! Query embedding and the HNSW graph backing snapshot indices
//!
//! - `Embedder` trait, one per index, chosen once at construction
//! - `FastEmbedEmbedder` for local CPU inference
//! - `OllamaEmbedder` for models served by Ollama (usually on a GPU)
//! - `VectorIndex`, a read-only cosine HNSW graph

mod ollama;
mod provider;
mod vector_index;

pub use ollama::OllamaEmbedder;
pub use provider::{build_embedder, Embedder, EmbeddingError, FastEmbedEmbedder};
pub use vector_index::{SearchResult, VectorIndex, VectorIndexError};
