//! The answer pipeline
//!
//! One request runs rewrite, parallel search, fusion, reranking, context
//! assembly, prompt composition and streamed generation, in that order.
//! Each stage is announced on the request's [`AnswerStream`] before it
//! starts, and every request ends with one `Done` or `Error` event unless
//! the caller cancels it first.
//!
//! [`RagEngine`] holds every long-lived collaborator and is built once;
//! requests share it read-only, so concurrent requests never see each
//! other's state.

mod budget;
mod events;
mod generation;
mod prompt;

pub use budget::{render_block, AssembledContext, ContextBlock, ContextBudgeter, CONTEXT_DELIMITER};
pub use events::{Answer, PipelineFailure, ProgressEvent, SourceRef, Stage};
pub use generation::{GenerationOutcome, GenerationStreamer};
pub use prompt::{
    format_history, render_template, ComposedPrompt, ConversationTurn, GenerationRequest,
    PromptComposer, PromptTemplate, EMPTY_HISTORY,
};

use crate::config::Config;
use crate::error::{RaglineError, Result};
use crate::index::IndexRegistry;
use crate::llm::{GenerationParams, LanguageModel, OllamaClient};
use crate::retrieval::{
    reciprocal_rank_fusion, FastEmbedScorer, FusionConfig, ParallelRetriever, QueryError,
    QueryRewriter, RelevanceScorer, Reranker,
};
use crate::tokens::{TiktokenCounter, Tokenizer};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tunables the engine reads at construction
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_k: usize,
    pub rrf_k: f32,
    pub rerank_top_n: usize,
    /// Maximum tokens of assembled context
    pub context_budget: usize,
    pub rewrite_timeout: Duration,
    pub rewrite_template: String,
    pub with_context_template: String,
    pub no_context_template: String,
    /// Generation defaults, overridable per request
    pub generation: GenerationParams,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            top_k: config.retrieval.top_k,
            rrf_k: config.retrieval.rrf_k,
            rerank_top_n: config.retrieval.rerank_top_n,
            context_budget: config.llm.context_budget(),
            rewrite_timeout: config.llm.rewrite_timeout()?,
            rewrite_template: config.prompts.rewrite.clone(),
            with_context_template: config.prompts.with_context.clone(),
            no_context_template: config.prompts.no_context.clone(),
            generation: GenerationParams {
                temperature: config.llm.temperature,
                max_output_tokens: config.llm.max_output_tokens,
                compute_hint: Some(config.llm.gpu_layers),
            },
        })
    }
}

/// Per-request overrides
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub compute_hint: Option<u32>,
    /// Only consider chunks of this category (case-insensitive)
    pub category: Option<String>,
}

struct AnswerRequest {
    question: String,
    history: Vec<ConversationTurn>,
    options: AnswerOptions,
}

pub struct RagEngine {
    rewriter: QueryRewriter,
    retriever: ParallelRetriever,
    fusion: FusionConfig,
    reranker: Reranker,
    budgeter: ContextBudgeter,
    composer: PromptComposer,
    streamer: GenerationStreamer,
    generation: GenerationParams,
}

impl RagEngine {
    pub fn new(
        registry: IndexRegistry,
        scorer: Arc<dyn RelevanceScorer>,
        llm: Arc<dyn LanguageModel>,
        tokenizer: Arc<dyn Tokenizer>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let fusion = FusionConfig::new(settings.rrf_k).map_err(|e| {
            RaglineError::InvalidConfigValue {
                path: "retrieval.rrf_k".to_string(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            rewriter: QueryRewriter::new(
                Arc::clone(&llm),
                settings.rewrite_template,
                settings.rewrite_timeout,
            ),
            retriever: ParallelRetriever::new(registry, settings.top_k),
            fusion,
            reranker: Reranker::new(scorer, settings.rerank_top_n),
            budgeter: ContextBudgeter::new(tokenizer, settings.context_budget),
            composer: PromptComposer::new(
                settings.with_context_template,
                settings.no_context_template,
            ),
            streamer: GenerationStreamer::new(llm),
            generation: settings.generation,
        })
    }

    /// Build the production engine: snapshot indices, FastEmbed reranker,
    /// Ollama client and tiktoken counter
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = IndexRegistry::from_config(config)?;
        let scorer = FastEmbedScorer::new(
            &config.retrieval.reranker_model,
            config.retrieval.rerank_batch_size,
        )
        .map_err(|e| RaglineError::init("reranker", e))?;
        let llm = OllamaClient::new(&config.llm).map_err(|e| RaglineError::init("language model", e))?;
        let tokenizer = TiktokenCounter::new(config.tokenizer.cache_capacity)?;

        info!(
            indices = registry.len(),
            model = llm.model(),
            reranker = scorer.model_name(),
            "Engine ready"
        );

        Self::new(
            registry,
            Arc::new(scorer),
            Arc::new(llm),
            Arc::new(tokenizer),
            PipelineSettings::from_config(config)?,
        )
    }

    pub fn registry(&self) -> &IndexRegistry {
        self.retriever.registry()
    }

    /// Start answering `question` and return its event stream
    ///
    /// Must be called from within a Tokio runtime. The request runs on its
    /// own task; dropping or cancelling the stream stops it.
    pub fn answer(
        self: &Arc<Self>,
        question: impl Into<String>,
        history: Vec<ConversationTurn>,
        options: AnswerOptions,
    ) -> AnswerStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let request_id = Uuid::new_v4();

        let request = AnswerRequest {
            question: question.into(),
            history,
            options,
        };
        let engine = Arc::clone(self);
        let token = cancel.clone();

        tokio::spawn(
            async move {
                tokio::select! {
                    _ = token.cancelled() => info!("Request cancelled"),
                    _ = engine.execute(request, tx) => {}
                }
            }
            .instrument(info_span!("answer", request_id = %request_id)),
        );

        AnswerStream {
            events: ReceiverStream::new(rx),
            cancel,
            request_id,
        }
    }

    async fn execute(&self, request: AnswerRequest, events: mpsc::Sender<ProgressEvent>) {
        info!(
            history_turns = request.history.len(),
            category = request.options.category.as_deref().unwrap_or("*"),
            "Answering question"
        );
        let started = Instant::now();
        let mut run = Run::new(events);

        match self.drive(&request, &mut run).await {
            Ok(answer) => {
                info!(
                    chars = answer.text.len(),
                    sources = answer.sources.len(),
                    interrupted = answer.interrupted.is_some(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Answer complete"
                );
                run.finish(answer).await;
            }
            Err(Halt::Fatal(err)) => {
                error!(kind = %err.kind(), error = %err, "Request failed");
                run.fail(&err).await;
            }
            Err(Halt::Closed) => debug!("Answer consumer went away"),
        }
    }

    async fn drive(&self, request: &AnswerRequest, run: &mut Run) -> std::result::Result<Answer, Halt> {
        run.enter(Stage::Rewriting).await?;
        let standalone = self
            .rewriter
            .rewrite(&request.question, &request.history)
            .await;

        run.enter(Stage::Searching).await?;
        let retrieved = self
            .retriever
            .retrieve(&standalone, request.options.category.as_deref())
            .await?;
        info!(
            answered = retrieved.lists.len(),
            failed = retrieved.failures.len(),
            candidates = retrieved.candidate_count(),
            "Retrieval complete"
        );

        run.enter(Stage::Fusing).await?;
        let fused = reciprocal_rank_fusion(&retrieved.lists, &self.fusion);

        run.enter(Stage::Reranking).await?;
        let reranked = self
            .reranker
            .rerank(&standalone, fused)
            .await
            .map_err(QueryError::from)?;

        run.enter(Stage::BuildingContext).await?;
        let context = self.budgeter.assemble(&reranked);
        let context_text = context.text();
        debug!(
            blocks = context.blocks.len(),
            tokens = context.total_tokens,
            budget = self.budgeter.max_tokens(),
            "Context assembled"
        );

        run.enter(Stage::Composing).await?;
        let generation = GenerationRequest {
            original_question: &request.question,
            rewritten_question: &standalone,
            history: &request.history,
            context: &context_text,
            params: self.params_for(&request.options),
        };
        let prompt = self.composer.compose(&generation);
        debug!(template = ?prompt.template, chars = prompt.text.len(), "Prompt composed");

        run.enter(Stage::Generating).await?;
        let outcome = self
            .streamer
            .stream(&prompt.text, &generation.params, &run.events)
            .await
            .ok_or(Halt::Closed)?;

        Ok(Answer {
            text: outcome.text,
            sources: context
                .blocks
                .iter()
                .map(|block| SourceRef::from(&block.candidate))
                .collect(),
            interrupted: outcome.interrupted,
        })
    }

    fn params_for(&self, options: &AnswerOptions) -> GenerationParams {
        GenerationParams {
            temperature: options.temperature.unwrap_or(self.generation.temperature),
            max_output_tokens: options
                .max_output_tokens
                .unwrap_or(self.generation.max_output_tokens),
            compute_hint: options.compute_hint.or(self.generation.compute_hint),
        }
    }
}

/// Why a request stopped early
enum Halt {
    /// The event receiver is gone
    Closed,
    Fatal(QueryError),
}

impl From<QueryError> for Halt {
    fn from(err: QueryError) -> Self {
        Self::Fatal(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    Running(Stage),
    Done,
    Failed,
}

/// Event sink and lifecycle of one request
struct Run {
    events: mpsc::Sender<ProgressEvent>,
    state: PipelineState,
}

impl Run {
    fn new(events: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            events,
            state: PipelineState::Idle,
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "Pipeline transition");
        self.state = next;
    }

    async fn enter(&mut self, stage: Stage) -> std::result::Result<(), Halt> {
        self.transition(PipelineState::Running(stage));
        self.events
            .send(ProgressEvent::Stage(stage))
            .await
            .map_err(|_| Halt::Closed)
    }

    async fn finish(&mut self, answer: Answer) {
        self.transition(PipelineState::Done);
        let _ = self.events.send(ProgressEvent::Done(answer)).await;
    }

    async fn fail(&mut self, err: &QueryError) {
        self.transition(PipelineState::Failed);
        let _ = self
            .events
            .send(ProgressEvent::Error(PipelineFailure::from(err)))
            .await;
    }
}

/// Events of one request, in order
///
/// Dropping the stream cancels the request. After cancellation the stream
/// ends without a terminal event.
pub struct AnswerStream {
    events: ReceiverStream<ProgressEvent>,
    cancel: CancellationToken,
    request_id: Uuid,
}

impl AnswerStream {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Stop the request; in-flight model calls are abandoned
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream and return its terminal event
    ///
    /// `None` if the request was cancelled before finishing.
    pub async fn final_answer(mut self) -> Option<std::result::Result<Answer, PipelineFailure>> {
        while let Some(event) = self.next().await {
            match event {
                ProgressEvent::Done(answer) => return Some(Ok(answer)),
                ProgressEvent::Error(failure) => return Some(Err(failure)),
                ProgressEvent::Stage(_) | ProgressEvent::Partial(_) => {}
            }
        }
        None
    }
}

impl Stream for AnswerStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
