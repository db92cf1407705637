//! Token accounting for the context budget
//!
//! `cl100k_base` only approximates the tokenizers of local models; the
//! budget fraction leaves headroom for the difference.

use crate::error::{Result, RaglineError};
use moka::sync::Cache;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Counts model tokens in a piece of text
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Token counter wrapping tiktoken's cl100k_base tokenizer.
/// Caches results per blake3 content hash.
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
    cache: Cache<String, usize>,
}

impl TiktokenCounter {
    pub fn new(cache_capacity: u64) -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| RaglineError::init("tokenizer", e))?;
        Ok(Self {
            bpe: Arc::new(bpe),
            cache: Cache::new(cache_capacity),
        })
    }

    /// Count tokens without touching the cache
    pub fn count_uncached(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

impl Tokenizer for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        let hash = blake3::hash(text.as_bytes()).to_hex().to_string();
        self.cache.get_with(hash, || self.count_uncached(text))
    }
}
