use crate::llm::{LanguageModel, LlmError};
use crate::pipeline::{format_history, render_template, ConversationTurn};
use crate::retrieval::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Turns a follow-up question into one that stands on its own
///
/// Never fails: any problem with the rewrite call falls back to the
/// question as asked.
#[derive(Clone)]
pub struct QueryRewriter {
    llm: Arc<dyn LanguageModel>,
    template: String,
    timeout: Duration,
}

impl QueryRewriter {
    pub fn new(llm: Arc<dyn LanguageModel>, template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            template: template.into(),
            timeout,
        }
    }

    /// Rewrite `question` using `history`; the first turn is returned as is
    pub async fn rewrite(&self, question: &str, history: &[ConversationTurn]) -> String {
        if history.is_empty() {
            return question.to_string();
        }

        let history_text = format_history(history);
        let prompt = render_template(
            &self.template,
            &[("history", history_text.as_str()), ("question", question)],
        );

        let reply = tokio::time::timeout(self.timeout, self.llm.complete(&prompt))
            .await
            .unwrap_or(Err(LlmError::Timeout(self.timeout)));

        match reply {
            Ok(rewritten) if !rewritten.trim().is_empty() => {
                let rewritten = rewritten.trim();
                debug!(original = question, rewritten, "Rewrote follow-up question");
                rewritten.to_string()
            }
            Ok(_) => {
                warn!(kind = %ErrorKind::RewriteFailure, "Rewrite came back empty, using original question");
                question.to_string()
            }
            Err(e) => {
                warn!(kind = %ErrorKind::RewriteFailure, error = %e, "Rewrite failed, using original question");
                question.to_string()
            }
        }
    }
}
