//! HNSW vector index for similarity search
use hnsw_rs::prelude::*;
use thiserror::Error;

const HNSW_MAX_CONNECTIONS: usize = 16;
const HNSW_MAX_LAYERS: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Index is empty")]
    Empty,
}

/// Search result with position and similarity score
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Position of the vector in the snapshot it was built from
    pub id: usize,
    /// Cosine similarity score (higher is more similar)
    pub score: f32,
}

/// Read-only HNSW graph over the vectors of one snapshot
///
/// Uses cosine distance. The graph is built once and never mutated, so it
/// can be searched from many requests at the same time.
pub struct VectorIndex {
    index: Hnsw<'static, f32, DistCosine>,
    dimension: usize,
    count: usize,
}

impl VectorIndex {
    /// Build an index where each vector's id is its position in `vectors`
    pub fn build(vectors: &[Vec<f32>]) -> Result<Self, VectorIndexError> {
        let dimension = vectors.first().map(Vec::len).ok_or(VectorIndexError::Empty)?;

        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(VectorIndexError::InvalidDimension {
                expected: dimension,
                actual: bad.len(),
            });
        }

        let index = Hnsw::<f32, DistCosine>::new(
            HNSW_MAX_CONNECTIONS,
            vectors.len(),
            HNSW_MAX_LAYERS,
            HNSW_EF_CONSTRUCTION,
            DistCosine,
        );

        let items: Vec<(&Vec<f32>, usize)> = vectors.iter().zip(0..).collect();
        index.parallel_insert(&items);

        Ok(Self {
            index,
            dimension,
            count: vectors.len(),
        })
    }

    /// Search for k nearest neighbors
    ///
    /// # Returns
    /// Results sorted by similarity descending; equal scores keep the lower id first
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<SearchResult>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut results: Vec<SearchResult> = self
            .index
            .search(query, k, ef_search.max(k))
            .into_iter()
            .map(|neighbor| SearchResult {
                id: neighbor.d_id,
                score: 1.0 - neighbor.distance,
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        results.truncate(k);

        Ok(results)
    }

    /// Get the number of vectors in the index
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}
