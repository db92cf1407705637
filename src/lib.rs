//! Ragline - multi-index retrieval-augmented question answering
//!
//! Answers a question (with optional conversation history) by rewriting it
//! into a standalone query, searching several vector indices in parallel,
//! fusing their rankings, reranking with a cross-encoder, packing the best
//! passages into a token budget and streaming the model's answer back as
//! progress events.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
pub mod tokens;

pub use error::{RaglineError, Result};
pub use pipeline::{
    Answer, AnswerOptions, AnswerStream, ConversationTurn, PipelineSettings, ProgressEvent,
    RagEngine, Stage,
};
pub use retrieval::{ErrorKind, QueryError};
