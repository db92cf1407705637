//! Prompt composition
//!
//! Templates use `{name}` placeholders: `{history}`, `{context}`,
//! `{question}` (as the user asked it) and `{standalone_question}` (as
//! rewritten). Rendering is a single pass, so text substituted into a
//! placeholder is never itself expanded.

use crate::config::PromptConfig;
use crate::llm::GenerationParams;
use serde::{Deserialize, Serialize};

/// Shown in place of an empty conversation
pub const EMPTY_HISTORY: &str = "(no previous conversation)";

/// One completed exchange of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_message: String,
    pub assistant_message: String,
}

impl ConversationTurn {
    pub fn new(user_message: impl Into<String>, assistant_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            assistant_message: assistant_message.into(),
        }
    }
}

/// Everything the final prompt and the generation call need
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub original_question: &'a str,
    pub rewritten_question: &'a str,
    pub history: &'a [ConversationTurn],
    /// Assembled context text; empty when nothing survived budgeting
    pub context: &'a str,
    pub params: GenerationParams,
}

/// Which template produced a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplate {
    WithContext,
    NoContext,
}

/// A rendered prompt ready for the language model
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedPrompt {
    pub template: PromptTemplate,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PromptComposer {
    with_context: String,
    no_context: String,
}

impl PromptComposer {
    pub fn new(with_context: impl Into<String>, no_context: impl Into<String>) -> Self {
        Self {
            with_context: with_context.into(),
            no_context: no_context.into(),
        }
    }

    pub fn from_config(prompts: &PromptConfig) -> Self {
        Self::new(prompts.with_context.clone(), prompts.no_context.clone())
    }

    /// Pick the template by whether any context survived, then fill it in
    pub fn compose(&self, request: &GenerationRequest<'_>) -> ComposedPrompt {
        let history = format_history(request.history);
        let values = [
            ("history", history.as_str()),
            ("context", request.context),
            ("question", request.original_question),
            ("standalone_question", request.rewritten_question),
        ];

        let (template, source) = if request.context.trim().is_empty() {
            (PromptTemplate::NoContext, &self.no_context)
        } else {
            (PromptTemplate::WithContext, &self.with_context)
        };

        ComposedPrompt {
            template,
            text: render_template(source, &values),
        }
    }
}

/// Render turns oldest first as `User: ...` / `Assistant: ...` lines
pub fn format_history(history: &[ConversationTurn]) -> String {
    if history.is_empty() {
        return EMPTY_HISTORY.to_string();
    }

    history
        .iter()
        .map(|turn| format!("User: {}\nAssistant: {}", turn.user_message, turn.assistant_message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace `{name}` placeholders in one left-to-right pass
///
/// Unknown placeholders and stray braces are copied through untouched.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        let closed = after[name_len..].starts_with('}');

        match values.iter().find(|(key, _)| *key == name) {
            Some((_, value)) if closed && !name.is_empty() => {
                out.push_str(value);
                rest = &after[name_len + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
