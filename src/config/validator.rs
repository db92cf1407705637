use crate::config::{parse_duration, Config, EmbedderBackend, SCHEMA_VERSION};
use crate::error::{Result, RaglineError, ValidationError};
use std::collections::HashSet;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_prompts(config, &mut errors);
        Self::validate_indices(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RaglineError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        if retrieval.top_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k",
                "top_k must be greater than 0",
            ));
        }

        // 1 / (rank + K) must stay finite and positive for rank 0
        if retrieval.rrf_k <= 0.0 || !retrieval.rrf_k.is_finite() {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                format!("RRF constant must be a positive number, got {}", retrieval.rrf_k),
            ));
        }

        if retrieval.rerank_top_n == 0 {
            errors.push(ValidationError::new(
                "retrieval.rerank_top_n",
                "rerank_top_n must be greater than 0",
            ));
        }

        if retrieval.category_overfetch == 0 {
            errors.push(ValidationError::new(
                "retrieval.category_overfetch",
                "category_overfetch must be at least 1",
            ));
        }

        if retrieval.rerank_batch_size == 0 {
            errors.push(ValidationError::new(
                "retrieval.rerank_batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if retrieval.reranker_model.is_empty() {
            errors.push(ValidationError::new(
                "retrieval.reranker_model",
                "Reranker model name cannot be empty",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        let llm = &config.llm;

        let endpoint = llm.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            errors.push(ValidationError::new(
                "llm.endpoint",
                format!("Endpoint must be an http(s) URL, got '{}'", llm.endpoint),
            ));
        }

        if llm.model.is_empty() {
            errors.push(ValidationError::new("llm.model", "Model name cannot be empty"));
        }

        if llm.context_window == 0 {
            errors.push(ValidationError::new(
                "llm.context_window",
                "Context window must be greater than 0",
            ));
        }

        let fraction = llm.context_budget_fraction;
        if fraction.is_nan() || fraction <= 0.0 || fraction > 1.0 {
            errors.push(ValidationError::new(
                "llm.context_budget_fraction",
                format!("Budget fraction must be in (0, 1], got {}", fraction),
            ));
        }

        let temp = llm.temperature;
        if !(0.0..=2.0).contains(&temp) {
            errors.push(ValidationError::new(
                "llm.temperature",
                format!("Temperature must be between 0.0 and 2.0, got {}", temp),
            ));
        }

        if llm.max_output_tokens == 0 {
            errors.push(ValidationError::new(
                "llm.max_output_tokens",
                "max_output_tokens must be greater than 0",
            ));
        }

        for (path, value) in [
            ("llm.rewrite_timeout", &llm.rewrite_timeout),
            ("llm.request_timeout", &llm.request_timeout),
        ] {
            if parse_duration(value).is_none() {
                errors.push(ValidationError::new(
                    path,
                    format!("Invalid duration format: {}", value),
                ));
            }
        }
    }

    fn validate_prompts(config: &Config, errors: &mut Vec<ValidationError>) {
        let prompts = &config.prompts;
        let required: [(&str, &str, &[&str]); 3] = [
            (
                "prompts.with_context",
                prompts.with_context.as_str(),
                &["{context}", "{question}"],
            ),
            ("prompts.no_context", prompts.no_context.as_str(), &["{question}"]),
            (
                "prompts.rewrite",
                prompts.rewrite.as_str(),
                &["{history}", "{question}"],
            ),
        ];

        for (path, template, placeholders) in required {
            for placeholder in placeholders {
                if !template.contains(placeholder) {
                    errors.push(ValidationError::new(
                        path,
                        format!("Template is missing the {} placeholder", placeholder),
                    ));
                }
            }
        }
    }

    fn validate_indices(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.indices.is_empty() {
            errors.push(ValidationError::new(
                "indices",
                "At least one index must be configured",
            ));
        }

        let mut seen = HashSet::new();
        for (i, index) in config.indices.iter().enumerate() {
            if index.key.is_empty() {
                errors.push(ValidationError::new(
                    format!("indices[{}].key", i),
                    "Index key cannot be empty",
                ));
            } else if !seen.insert(index.key.as_str()) {
                errors.push(ValidationError::new(
                    format!("indices[{}].key", i),
                    format!("Duplicate index key: {}", index.key),
                ));
            }

            if index.path.as_os_str().is_empty() {
                errors.push(ValidationError::new(
                    format!("indices[{}].path", i),
                    "Index path cannot be empty",
                ));
            }

            if index.embedder.model.is_empty() {
                errors.push(ValidationError::new(
                    format!("indices[{}].embedder.model", i),
                    "Embedding model name cannot be empty",
                ));
            }

            if index.embedder.backend == EmbedderBackend::Fastembed
                && index.embedder.endpoint.is_some()
            {
                errors.push(ValidationError::new(
                    format!("indices[{}].embedder.endpoint", i),
                    "The fastembed backend runs locally and takes no endpoint",
                ));
            }
        }
    }
}
