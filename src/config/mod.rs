//! Configuration management for Ragline
//!
//! Deployment-owned knobs only: index locations, retrieval widths, model
//! endpoints and prompt templates. Nothing here changes pipeline behavior.

use crate::error::{Result, RaglineError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub prompts: PromptConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub indices: Vec<IndexConfig>,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Retrieval, fusion and reranking widths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates requested from every index
    pub top_k: usize,
    /// RRF K constant (typically 60)
    pub rrf_k: f32,
    /// Candidates kept after reranking
    pub rerank_top_n: usize,
    /// Neighbour multiplier used when a category filter is active
    pub category_overfetch: usize,
    /// HNSW search parameter (higher = better recall, slower search)
    pub hnsw_ef_search: usize,
    pub reranker_model: String,
    pub rerank_batch_size: usize,
}

/// Language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Context window of the model, in tokens
    pub context_window: usize,
    /// Share of the context window the retrieved context may occupy
    pub context_budget_fraction: f32,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Number of model layers offloaded to the GPU
    pub gpu_layers: u32,
    pub rewrite_timeout: String,
    pub request_timeout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl LlmConfig {
    /// Maximum number of tokens the assembled context may use
    pub fn context_budget(&self) -> usize {
        (self.context_window as f64 * self.context_budget_fraction as f64).floor() as usize
    }

    pub fn rewrite_timeout(&self) -> Result<Duration> {
        duration_value("llm.rewrite_timeout", &self.rewrite_timeout)
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        duration_value("llm.request_timeout", &self.request_timeout)
    }
}

/// Prompt templates
///
/// Placeholders: `{history}`, `{context}`, `{question}`, `{standalone_question}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub with_context: String,
    pub no_context: String,
    pub rewrite: String,
}

/// Token counter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub cache_capacity: u64,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
        }
    }
}

/// One read-only vector index built by the ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Embedding strategy key, e.g. "bge_m3"
    pub key: String,
    /// Snapshot directory containing `chunks.jsonl`
    pub path: PathBuf,
    pub embedder: EmbedderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderBackend {
    /// Local CPU inference through fastembed
    Fastembed,
    /// Remote (usually GPU-served) embeddings through Ollama
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    pub backend: EmbedderBackend,
    pub model: String,
    /// Ollama endpoint; defaults to `llm.endpoint`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RaglineError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| RaglineError::ProfileNotFound {
                name: profile.to_string(),
            })?;

        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        if let Some(temperature) = overrides.temperature {
            self.llm.temperature = temperature;
        }
        if let Some(layers) = overrides.gpu_layers {
            self.llm.gpu_layers = layers;
        }
        if let Some(window) = overrides.context_window {
            self.llm.context_window = window;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: RAGLINE_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("RAGLINE_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "LLM__MODEL" => self.llm.model = value.to_string(),
            "LLM__ENDPOINT" => self.llm.endpoint = value.to_string(),
            "LLM__TEMPERATURE" => self.llm.temperature = parse_env(path, value)?,
            "LLM__CONTEXT_WINDOW" => self.llm.context_window = parse_env(path, value)?,
            "LLM__GPU_LAYERS" => self.llm.gpu_layers = parse_env(path, value)?,
            "RETRIEVAL__TOP_K" => self.retrieval.top_k = parse_env(path, value)?,
            "RETRIEVAL__RERANK_TOP_N" => self.retrieval.rerank_top_n = parse_env(path, value)?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| RaglineError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("ragline").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| RaglineError::Config("Cannot determine home directory".to_string()))?;

        Ok(home_dir.join(".ragline"))
    }
}

impl Default for Config {
    fn default() -> Self {
        let index_dir = PathBuf::from("~/.ragline").join("indices");
        let index = |key: &str, backend: EmbedderBackend, model: &str| IndexConfig {
            key: key.to_string(),
            path: index_dir.join(key),
            embedder: EmbedderConfig {
                backend,
                model: model.to_string(),
                endpoint: None,
            },
        };

        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            retrieval: RetrievalConfig {
                top_k: 15,
                rrf_k: 60.0,
                rerank_top_n: 15,
                category_overfetch: 3,
                hnsw_ef_search: 64,
                reranker_model: "bge-reranker-base".to_string(),
                rerank_batch_size: 32,
            },
            llm: LlmConfig {
                endpoint: "http://localhost:11434".to_string(),
                model: "gemma3:12b-it-qat".to_string(),
                context_window: 4096,
                context_budget_fraction: 0.8,
                temperature: 0.2,
                max_output_tokens: 4096,
                gpu_layers: 35,
                rewrite_timeout: "30s".to_string(),
                request_timeout: "300s".to_string(),
                system: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            },
            prompts: PromptConfig {
                with_context: DEFAULT_WITH_CONTEXT_TEMPLATE.to_string(),
                no_context: DEFAULT_NO_CONTEXT_TEMPLATE.to_string(),
                rewrite: DEFAULT_REWRITE_TEMPLATE.to_string(),
            },
            tokenizer: TokenizerConfig::default(),
            indices: vec![
                index("bge_m3", EmbedderBackend::Ollama, "bge-m3"),
                index("nomic", EmbedderBackend::Ollama, "nomic-embed-text"),
                index("minilm", EmbedderBackend::Fastembed, "all-MiniLM-L6-v2"),
            ],
            profiles: HashMap::from([
                (
                    "cpu".to_string(),
                    ProfileOverrides {
                        gpu_layers: Some(0),
                        ..Default::default()
                    },
                ),
                (
                    "long".to_string(),
                    ProfileOverrides {
                        context_window: Some(16384),
                        ..Default::default()
                    },
                ),
            ]),
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert programming assistant covering .NET, \
domain-driven design, Python and modern web development. Answer in Markdown with highlighted code.";

pub const DEFAULT_WITH_CONTEXT_TEMPLATE: &str = "Use the context below to answer the question.

Rules:
1. Give technical answers with code examples when relevant.
2. Format the answer in Markdown.
3. If the context does not contain the answer, say so instead of guessing.
4. Reference the sources you used.

Conversation so far:
{history}

Context:
{context}

Question: {question}

Answer:";

pub const DEFAULT_NO_CONTEXT_TEMPLATE: &str = "No indexed document matched this question. \
Answer from general knowledge and state that no sources were found.

Conversation so far:
{history}

Question: {question}

Answer:";

pub const DEFAULT_REWRITE_TEMPLATE: &str = "Given the conversation below and a follow-up question, \
rewrite the follow-up as a standalone question that can be understood without the conversation. \
Return only the rewritten question.

Conversation:
{history}

Follow-up question: {question}

Standalone question:";

/// Parse duration strings like "30s", "5m", "1h" or plain seconds
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => s.split_at(idx),
        None => (s, "s"),
    };
    let amount: u64 = digits.parse().ok()?;
    let secs = match unit {
        "s" => amount,
        "m" => amount.checked_mul(60)?,
        "h" => amount.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

fn duration_value(path: &str, value: &str) -> Result<Duration> {
    parse_duration(value).ok_or_else(|| RaglineError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Invalid duration format: {}", value),
    })
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| RaglineError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Expand a leading `~` to the home directory
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().ok_or_else(|| {
                RaglineError::Config("Cannot determine home directory".to_string())
            })?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}
