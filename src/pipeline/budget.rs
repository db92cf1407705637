//! Greedy, token-budgeted context assembly

use crate::retrieval::RerankedCandidate;
use crate::tokens::Tokenizer;
use std::sync::Arc;
use tracing::debug;

/// Placed between blocks in the assembled context; not counted against the budget
pub const CONTEXT_DELIMITER: &str = "\n\n---\n\n";

/// One candidate rendered for the prompt
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBlock {
    pub text: String,
    pub tokens: usize,
    pub candidate: RerankedCandidate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
    pub total_tokens: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks joined with [`CONTEXT_DELIMITER`]
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_DELIMITER)
    }
}

/// Render a candidate as `Source: <path>`, a blank line, then its text
pub fn render_block(candidate: &RerankedCandidate) -> String {
    format!(
        "Source: {}\n\n{}",
        candidate.chunk.source_path, candidate.chunk.text
    )
}

pub struct ContextBudgeter {
    tokenizer: Arc<dyn Tokenizer>,
    max_tokens: usize,
}

impl ContextBudgeter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, max_tokens: usize) -> Self {
        Self {
            tokenizer,
            max_tokens,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Take candidates in order while they fit
    ///
    /// Stops at the first block that would overflow the budget; later,
    /// smaller blocks are not considered.
    pub fn assemble(&self, candidates: &[RerankedCandidate]) -> AssembledContext {
        let mut context = AssembledContext::default();

        for candidate in candidates {
            let text = render_block(candidate);
            let tokens = self.tokenizer.count(&text);

            if context.total_tokens + tokens > self.max_tokens {
                debug!(
                    included = context.blocks.len(),
                    used = context.total_tokens,
                    budget = self.max_tokens,
                    next_block = tokens,
                    "Context budget reached"
                );
                break;
            }

            context.total_tokens += tokens;
            context.blocks.push(ContextBlock {
                text,
                tokens,
                candidate: candidate.clone(),
            });
        }

        context
    }
}
