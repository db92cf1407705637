//! Snapshot-backed index: `chunks.jsonl` produced by ingestion, searched via HNSW

use crate::embedding::{Embedder, VectorIndex};
use crate::index::{IndexError, RetrievedChunk, VectorStore, DEFAULT_CATEGORY};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// File inside an index directory holding one chunk record per line
pub const SNAPSHOT_FILE: &str = "chunks.jsonl";

#[derive(Debug, Deserialize)]
struct ChunkRecord {
    #[serde(default)]
    chunk_id: Option<String>,
    text: String,
    #[serde(default)]
    source_path: Option<String>,
    #[serde(default)]
    category: Option<String>,
    embedding: Vec<f32>,
}

struct LoadedSnapshot {
    chunks: Vec<RetrievedChunk>,
    vectors: VectorIndex,
}

impl LoadedSnapshot {
    fn read(key: &str, file: &Path) -> Result<Self, IndexError> {
        let content = std::fs::read_to_string(file).map_err(|source| IndexError::Io {
            path: file.to_path_buf(),
            source,
        })?;

        let mut chunks = Vec::new();
        let mut embeddings = Vec::new();
        let mut seen = HashSet::new();

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let record: ChunkRecord =
                serde_json::from_str(line).map_err(|e| IndexError::Corrupt {
                    path: file.to_path_buf(),
                    line: line_no + 1,
                    message: e.to_string(),
                })?;

            let source_path = record.source_path.unwrap_or_else(|| "unknown".to_string());
            let chunk_id = record
                .chunk_id
                .unwrap_or_else(|| format!("{}::{}", source_path, chunks.len()));

            if !seen.insert(chunk_id.clone()) {
                return Err(IndexError::DuplicateChunk(chunk_id));
            }

            chunks.push(RetrievedChunk {
                chunk_id,
                text: record.text,
                source_path,
                category: record
                    .category
                    .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
                index_key: key.to_string(),
            });
            embeddings.push(record.embedding);
        }

        let vectors = VectorIndex::build(&embeddings)?;

        Ok(Self { chunks, vectors })
    }
}

/// One read-only index loaded lazily from its snapshot directory
///
/// The snapshot is loaded on first use and then shared; a failed load is not
/// remembered, so the next request tries again.
pub struct SnapshotIndex {
    key: String,
    file: PathBuf,
    embedder: Arc<dyn Embedder>,
    ef_search: usize,
    category_overfetch: usize,
    loaded: OnceCell<Arc<LoadedSnapshot>>,
}

impl SnapshotIndex {
    pub fn new(
        key: impl Into<String>,
        dir: &Path,
        embedder: Arc<dyn Embedder>,
        ef_search: usize,
        category_overfetch: usize,
    ) -> Self {
        Self {
            key: key.into(),
            file: dir.join(SNAPSHOT_FILE),
            embedder,
            ef_search,
            category_overfetch: category_overfetch.max(1),
            loaded: OnceCell::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn snapshot(&self) -> Result<Arc<LoadedSnapshot>, IndexError> {
        let snapshot = self
            .loaded
            .get_or_try_init(|| async {
                let key = self.key.clone();
                let file = self.file.clone();
                let snapshot =
                    tokio::task::spawn_blocking(move || LoadedSnapshot::read(&key, &file))
                        .await
                        .map_err(|e| IndexError::Task(e.to_string()))??;

                info!(
                    index = %self.key,
                    chunks = snapshot.chunks.len(),
                    dimension = snapshot.vectors.dimension(),
                    "Loaded index snapshot"
                );
                Ok::<_, IndexError>(Arc::new(snapshot))
            })
            .await?;

        Ok(Arc::clone(snapshot))
    }
}

#[async_trait]
impl VectorStore for SnapshotIndex {
    async fn search(
        &self,
        query: &str,
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<RetrievedChunk>, IndexError> {
        let snapshot = self.snapshot().await?;
        let embedding = self.embedder.embed(query).await?;

        let fetch = match category {
            Some(_) => k.saturating_mul(self.category_overfetch),
            None => k,
        };

        let searched = Arc::clone(&snapshot);
        let ef_search = self.ef_search;
        let hits = tokio::task::spawn_blocking(move || {
            searched.vectors.search(&embedding, fetch, ef_search)
        })
        .await
        .map_err(|e| IndexError::Task(e.to_string()))??;

        let chunks: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter_map(|hit| snapshot.chunks.get(hit.id))
            .filter(|chunk| category.map_or(true, |c| chunk.in_category(c)))
            .take(k)
            .cloned()
            .collect();

        debug!(index = %self.key, results = chunks.len(), "Index search complete");

        Ok(chunks)
    }

    async fn ensure_loaded(&self) -> Result<usize, IndexError> {
        Ok(self.snapshot().await?.chunks.len())
    }
}
