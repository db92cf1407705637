use crate::retrieval::{ErrorKind, QueryError, RerankedCandidate};
use serde::Serialize;
use std::fmt;

/// Pipeline stage announced to the caller on entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Rewriting,
    Searching,
    Fusing,
    Reranking,
    BuildingContext,
    Composing,
    Generating,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Rewriting => "Rewriting question",
            Self::Searching => "Searching indices",
            Self::Fusing => "Fusing results",
            Self::Reranking => "Reranking candidates",
            Self::BuildingContext => "Building context",
            Self::Composing => "Composing prompt",
            Self::Generating => "Generating answer",
        };
        f.write_str(label)
    }
}

/// A document that made it into the prompt context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub source_path: String,
    pub category: String,
    pub index_key: String,
    pub relevance_score: f32,
}

impl From<&RerankedCandidate> for SourceRef {
    fn from(candidate: &RerankedCandidate) -> Self {
        Self {
            source_path: candidate.chunk.source_path.clone(),
            category: candidate.chunk.category.clone(),
            index_key: candidate.chunk.index_key.clone(),
            relevance_score: candidate.relevance_score,
        }
    }
}

/// Final result of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
    /// Set when generation broke off; `text` holds what arrived before
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<String>,
}

impl Answer {
    /// Answer text, followed by an interruption marker when generation broke off
    pub fn rendered(&self) -> String {
        match &self.interrupted {
            Some(reason) => format!("{}\n\n[generation interrupted: {}]", self.text, reason),
            None => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&QueryError> for PipelineFailure {
    fn from(err: &QueryError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// What an [`AnswerStream`](crate::pipeline::AnswerStream) yields
///
/// Every request ends with exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stage(Stage),
    /// Full answer text generated so far
    Partial(String),
    Done(Answer),
    Error(PipelineFailure),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }
}
