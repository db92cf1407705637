use crate::config::{expand_path, Config};
use crate::embedding::build_embedder;
use crate::error::{RaglineError, Result};
use crate::index::{IndexError, SnapshotIndex, VectorStore};
use std::sync::Arc;

/// One configured index and its search handle
#[derive(Clone)]
pub struct IndexHandle {
    pub key: String,
    pub store: Arc<dyn VectorStore>,
}

/// Owns one read-only handle per configured index
///
/// Handle order is the configured order; it decides fusion tie-breaks.
#[derive(Clone, Default)]
pub struct IndexRegistry {
    handles: Vec<IndexHandle>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index after the ones already present
    pub fn with_index(mut self, key: impl Into<String>, store: Arc<dyn VectorStore>) -> Self {
        self.handles.push(IndexHandle {
            key: key.into(),
            store,
        });
        self
    }

    /// Build snapshot indices and their embedders from configuration
    ///
    /// Embedders are constructed here, once; snapshots load on first search.
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = config.llm.request_timeout()?;
        let mut registry = Self::new();

        for index in &config.indices {
            let embedder = build_embedder(&index.embedder, &config.llm.endpoint, timeout)
                .map_err(|e| RaglineError::init(format!("embedder for index {}", index.key), e))?;
            let dir = expand_path(&index.path)?;

            tracing::info!(
                index = %index.key,
                embedder = embedder.model_name(),
                path = %dir.display(),
                "Registered index"
            );

            let store = SnapshotIndex::new(
                index.key.clone(),
                &dir,
                embedder,
                config.retrieval.hnsw_ef_search,
                config.retrieval.category_overfetch,
            );
            registry = registry.with_index(index.key.clone(), Arc::new(store));
        }

        Ok(registry)
    }

    pub fn handles(&self) -> &[IndexHandle] {
        &self.handles
    }

    pub fn keys(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Load every index and report its chunk count or load error
    pub async fn status(&self) -> Vec<(String, std::result::Result<usize, IndexError>)> {
        let checks = self.handles.iter().map(|h| async move {
            (h.key.clone(), h.store.ensure_loaded().await)
        });
        futures_util::future::join_all(checks).await
    }
}
