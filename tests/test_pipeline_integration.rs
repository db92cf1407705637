use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use ragline::config::Config;
use ragline::index::{IndexError, IndexRegistry, RetrievedChunk, VectorStore};
use ragline::llm::{FragmentStream, GenerationParams, LanguageModel, LlmError};
use ragline::pipeline::{
    Answer, AnswerOptions, AnswerStream, ConversationTurn, PipelineFailure, PipelineSettings,
    ProgressEvent, RagEngine, Stage,
};
use ragline::retrieval::{ErrorKind, RelevanceScorer, RerankError};
use ragline::tokens::Tokenizer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeIndex {
    name: &'static str,
    ids: Vec<&'static str>,
    fail: bool,
    queries: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeIndex {
    fn new(name: &'static str, ids: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            name,
            ids,
            fail: false,
            queries: Mutex::new(Vec::new()),
        })
    }

    fn broken(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            ids: Vec::new(),
            fail: true,
            queries: Mutex::new(Vec::new()),
        })
    }

    fn queries(&self) -> Vec<(String, Option<String>)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorStore for FakeIndex {
    async fn search(
        &self,
        query: &str,
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<RetrievedChunk>, IndexError> {
        self.queries
            .lock()
            .unwrap()
            .push((query.to_string(), category.map(str::to_string)));

        if self.fail {
            return Err(IndexError::Task(format!("{} is offline", self.name)));
        }

        Ok(self
            .ids
            .iter()
            .take(k)
            .map(|id| RetrievedChunk {
                chunk_id: id.to_string(),
                text: format!("text of {id}"),
                source_path: format!("{id}.md"),
                category: "general".to_string(),
                index_key: self.name.to_string(),
            })
            .collect())
    }
}

/// Scores passages from a lookup table keyed by chunk id; unknown ids score 0
struct FakeScorer {
    scores: HashMap<&'static str, f32>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeScorer {
    fn flat() -> Arc<Self> {
        Self::with(&[])
    }

    fn with(scores: &[(&'static str, f32)]) -> Arc<Self> {
        Arc::new(Self {
            scores: scores.iter().copied().collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            scores: HashMap::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RelevanceScorer for FakeScorer {
    async fn score_batch(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, RerankError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RerankError::RerankingError("cross-encoder crashed".to_string()));
        }
        Ok(passages
            .iter()
            .map(|p| {
                let id = p.trim_start_matches("text of ");
                self.scores.get(id).copied().unwrap_or(0.0)
            })
            .collect())
    }
}

enum Rewrite {
    Text(&'static str),
    Fail,
}

enum Generation {
    /// Stream these fragments, then optionally fail
    Fragments(Vec<&'static str>, Option<&'static str>),
    /// Stream the prompt back in one fragment
    Echo,
    /// Emit one fragment, then trickle forever; flags when dropped
    Endless(Arc<AtomicBool>),
}

struct FakeLlm {
    rewrite: Rewrite,
    generation: Generation,
    complete_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    params: Mutex<Vec<GenerationParams>>,
}

impl FakeLlm {
    fn new(rewrite: Rewrite, generation: Generation) -> Arc<Self> {
        Arc::new(Self {
            rewrite,
            generation,
            complete_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
        })
    }

    fn answering(fragments: Vec<&'static str>) -> Arc<Self> {
        Self::new(Rewrite::Text("unused"), Generation::Fragments(fragments, None))
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        match self.rewrite {
            Rewrite::Text(text) => Ok(text.to_string()),
            Rewrite::Fail => Err(LlmError::Upstream("rewrite model unavailable".to_string())),
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<FragmentStream, LlmError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.params.lock().unwrap().push(params.clone());

        match &self.generation {
            Generation::Fragments(parts, failure) => {
                let mut items: Vec<Result<String, LlmError>> =
                    parts.iter().map(|p| Ok(p.to_string())).collect();
                if let Some(message) = failure {
                    items.push(Err(LlmError::Decode(message.to_string())));
                }
                Ok(Box::pin(stream::iter(items)))
            }
            Generation::Echo => Ok(Box::pin(stream::iter(vec![Ok(prompt.to_string())]))),
            Generation::Endless(dropped) => {
                let guard = DropFlag(Arc::clone(dropped));
                let trickle = stream::unfold((0usize, guard), |(n, guard)| async move {
                    if n > 0 {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Some((Ok(format!("tok{n} ")), (n + 1, guard)))
                });
                Ok(Box::pin(trickle))
            }
        }
    }
}

/// Every block costs the same number of tokens
struct FlatTokenizer(usize);

impl Tokenizer for FlatTokenizer {
    fn count(&self, _text: &str) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WITH_CONTEXT: &str = "CTX[{context}] H[{history}] Q[{question}] S[{standalone_question}]";
const NO_CONTEXT: &str = "NOCTX H[{history}] Q[{question}]";

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::from_config(&Config::default()).unwrap();
    settings.with_context_template = WITH_CONTEXT.to_string();
    settings.no_context_template = NO_CONTEXT.to_string();
    settings.rewrite_template = "REWRITE {history} :: {question}".to_string();
    settings.rewrite_timeout = Duration::from_millis(200);
    settings
}

fn engine_with(
    registry: IndexRegistry,
    scorer: Arc<FakeScorer>,
    llm: Arc<FakeLlm>,
    tokenizer: Arc<dyn Tokenizer>,
    settings: PipelineSettings,
) -> Arc<RagEngine> {
    Arc::new(RagEngine::new(registry, scorer, llm, tokenizer, settings).unwrap())
}

fn engine(registry: IndexRegistry, scorer: Arc<FakeScorer>, llm: Arc<FakeLlm>) -> Arc<RagEngine> {
    engine_with(registry, scorer, llm, Arc::new(FlatTokenizer(10)), settings())
}

async fn collect(stream: AnswerStream) -> Vec<ProgressEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("pipeline did not finish in time")
}

fn stages(events: &[ProgressEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Stage(stage) => Some(*stage),
            _ => None,
        })
        .collect()
}

fn done(events: &[ProgressEvent]) -> &Answer {
    match events.last() {
        Some(ProgressEvent::Done(answer)) => answer,
        other => panic!("expected Done as last event, got {other:?}"),
    }
}

fn failure(events: &[ProgressEvent]) -> &PipelineFailure {
    match events.last() {
        Some(ProgressEvent::Error(failure)) => failure,
        other => panic!("expected Error as last event, got {other:?}"),
    }
}

fn source_paths(answer: &Answer) -> Vec<&str> {
    answer.sources.iter().map(|s| s.source_path.as_str()).collect()
}

const ALL_STAGES: [Stage; 7] = [
    Stage::Rewriting,
    Stage::Searching,
    Stage::Fusing,
    Stage::Reranking,
    Stage::BuildingContext,
    Stage::Composing,
    Stage::Generating,
];

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_turn_answer() {
    let index = FakeIndex::new("bge_m3", vec!["A", "B"]);
    let registry = IndexRegistry::new().with_index("bge_m3", index.clone());
    let llm = FakeLlm::answering(vec!["Aggregates ", "are consistency ", "boundaries."]);
    let engine = engine(registry, FakeScorer::with(&[("A", 0.2), ("B", 0.8)]), llm.clone());

    let events = collect(engine.answer("What is an aggregate?", Vec::new(), AnswerOptions::default())).await;

    assert_eq!(stages(&events), ALL_STAGES.to_vec());

    let partials: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Partial(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        partials,
        vec![
            "Aggregates ",
            "Aggregates are consistency ",
            "Aggregates are consistency boundaries."
        ]
    );

    let answer = done(&events);
    assert_eq!(answer.text, "Aggregates are consistency boundaries.");
    assert_eq!(answer.interrupted, None);
    assert_eq!(source_paths(answer), vec!["B.md", "A.md"]);

    // First turn never calls the rewrite model
    assert_eq!(llm.complete_calls.load(Ordering::SeqCst), 0);
    assert_eq!(index.queries()[0].0, "What is an aggregate?");
}

#[tokio::test]
async fn test_fused_order_survives_equal_relevance() {
    let registry = IndexRegistry::new()
        .with_index("a", FakeIndex::new("a", vec!["X", "Y"]))
        .with_index("b", FakeIndex::new("b", vec!["Y", "Z"]));
    let engine = engine(registry, FakeScorer::flat(), FakeLlm::answering(vec!["ok"]));

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    let answer = done(&events);
    assert_eq!(source_paths(answer), vec!["Y.md", "X.md", "Z.md"]);
    // Y was first seen in index "a"
    assert_eq!(answer.sources[0].index_key, "a");
}

#[tokio::test]
async fn test_rerank_keeps_top_n() {
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A", "B", "C"]));
    let mut settings = settings();
    settings.rerank_top_n = 2;
    let engine = engine_with(
        registry,
        FakeScorer::with(&[("A", 0.9), ("B", 0.1), ("C", 0.5)]),
        FakeLlm::answering(vec!["ok"]),
        Arc::new(FlatTokenizer(10)),
        settings,
    );

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    let answer = done(&events);
    assert_eq!(source_paths(answer), vec!["A.md", "C.md"]);
    assert_eq!(answer.sources[0].relevance_score, 0.9);
}

#[tokio::test]
async fn test_context_respects_token_budget() {
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A", "B", "C"]));
    let llm = FakeLlm::answering(vec!["ok"]);
    let mut settings = settings();
    settings.context_budget = 50;
    let engine = engine_with(
        registry,
        FakeScorer::with(&[("A", 0.9), ("B", 0.8), ("C", 0.7)]),
        llm.clone(),
        Arc::new(FlatTokenizer(20)),
        settings,
    );

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    assert_eq!(source_paths(done(&events)), vec!["A.md", "B.md"]);
    assert!(llm.last_prompt().starts_with(
        "CTX[Source: A.md\n\ntext of A\n\n---\n\nSource: B.md\n\ntext of B]"
    ));
}

#[tokio::test]
async fn test_empty_context_uses_no_context_template() {
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec![]));
    let scorer = FakeScorer::flat();
    let llm = FakeLlm::answering(vec!["From general knowledge..."]);
    let engine = engine(registry, scorer.clone(), llm.clone());

    let events = collect(engine.answer("Anything on sagas?", Vec::new(), AnswerOptions::default())).await;

    let answer = done(&events);
    assert!(answer.sources.is_empty());
    assert_eq!(
        llm.last_prompt(),
        "NOCTX H[(no previous conversation)] Q[Anything on sagas?]"
    );
    // Nothing to rerank, so the scorer is never called
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_follow_up_is_rewritten_before_search() {
    let index = FakeIndex::new("a", vec!["A"]);
    let registry = IndexRegistry::new().with_index("a", index.clone());
    let llm = FakeLlm::new(
        Rewrite::Text(" How large should a DDD aggregate be? "),
        Generation::Fragments(vec!["Small."], None),
    );
    let engine = engine(registry, FakeScorer::flat(), llm.clone());

    let history = vec![ConversationTurn::new("What is an aggregate?", "A consistency boundary.")];
    let events = collect(engine.answer("How large should it be?", history, AnswerOptions::default())).await;

    done(&events);
    assert_eq!(llm.complete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(index.queries()[0].0, "How large should a DDD aggregate be?");

    let prompt = llm.last_prompt();
    assert!(prompt.contains("H[User: What is an aggregate?\nAssistant: A consistency boundary.]"));
    assert!(prompt.contains("Q[How large should it be?]"));
    assert!(prompt.contains("S[How large should a DDD aggregate be?]"));
}

#[tokio::test]
async fn test_rewrite_failure_searches_original_question() {
    let index = FakeIndex::new("a", vec!["A"]);
    let registry = IndexRegistry::new().with_index("a", index.clone());
    let llm = FakeLlm::new(Rewrite::Fail, Generation::Fragments(vec!["ok"], None));
    let engine = engine(registry, FakeScorer::flat(), llm);

    let history = vec![ConversationTurn::new("hi", "hello")];
    let events = collect(engine.answer("And then?", history, AnswerOptions::default())).await;

    assert_eq!(stages(&events), ALL_STAGES.to_vec());
    done(&events);
    assert_eq!(index.queries()[0].0, "And then?");
}

#[tokio::test]
async fn test_one_failing_index_is_skipped() {
    let registry = IndexRegistry::new()
        .with_index("one", FakeIndex::new("one", vec!["A"]))
        .with_index("two", FakeIndex::broken("two"))
        .with_index("three", FakeIndex::new("three", vec!["C"]));
    let engine = engine(registry, FakeScorer::flat(), FakeLlm::answering(vec!["ok"]));

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    let answer = done(&events);
    assert_eq!(source_paths(answer), vec!["A.md", "C.md"]);
}

#[tokio::test]
async fn test_all_indices_failing_aborts() {
    let registry = IndexRegistry::new()
        .with_index("one", FakeIndex::broken("one"))
        .with_index("two", FakeIndex::broken("two"));
    let llm = FakeLlm::answering(vec!["never"]);
    let engine = engine(registry, FakeScorer::flat(), llm.clone());

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    let failure = failure(&events);
    assert_eq!(failure.kind, ErrorKind::AllIndexesFailed);
    assert!(failure.message.contains("one is offline"));
    assert_eq!(stages(&events), vec![Stage::Rewriting, Stage::Searching]);
    assert_eq!(llm.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rerank_failure_aborts() {
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A"]));
    let llm = FakeLlm::answering(vec!["never"]);
    let engine = engine(registry, FakeScorer::broken(), llm.clone());

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    assert_eq!(failure(&events).kind, ErrorKind::RerankFailure);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(llm.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_generation_failure_keeps_partial_answer() {
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A"]));
    let llm = FakeLlm::new(
        Rewrite::Text("unused"),
        Generation::Fragments(vec!["Value objects ", "are immutable"], Some("connection reset")),
    );
    let engine = engine(registry, FakeScorer::flat(), llm);

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    let answer = done(&events);
    assert_eq!(answer.text, "Value objects are immutable");
    let reason = answer.interrupted.as_deref().unwrap();
    assert!(reason.contains("connection reset"));
    assert_eq!(
        answer.rendered(),
        format!("Value objects are immutable\n\n[generation interrupted: {reason}]")
    );
    assert_eq!(source_paths(answer), vec!["A.md"]);
}

#[tokio::test]
async fn test_cancel_stops_generation() {
    let dropped = Arc::new(AtomicBool::new(false));
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A"]));
    let llm = FakeLlm::new(Rewrite::Text("unused"), Generation::Endless(Arc::clone(&dropped)));
    let engine = engine(registry, FakeScorer::flat(), llm);

    let mut stream = engine.answer("q", Vec::new(), AnswerOptions::default());

    // Wait for the first partial answer
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
            Ok(Some(ProgressEvent::Partial(_))) => break,
            Ok(Some(_)) => continue,
            other => panic!("stream ended before generating: {other:?}"),
        }
    }

    stream.cancel();

    let rest = collect(stream).await;
    assert!(rest.iter().all(|e| !e.is_terminal()));

    for _ in 0..50 {
        if dropped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("generation stream was not released after cancel");
}

#[tokio::test]
async fn test_dropping_stream_cancels_request() {
    let dropped = Arc::new(AtomicBool::new(false));
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A"]));
    let llm = FakeLlm::new(Rewrite::Text("unused"), Generation::Endless(Arc::clone(&dropped)));
    let engine = engine(registry, FakeScorer::flat(), llm);

    let mut stream = engine.answer("q", Vec::new(), AnswerOptions::default());
    while let Some(event) = stream.next().await {
        if matches!(event, ProgressEvent::Partial(_)) {
            break;
        }
    }
    drop(stream);

    for _ in 0..50 {
        if dropped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("generation stream was not released after drop");
}

#[tokio::test]
async fn test_repeated_runs_are_identical() {
    let registry = IndexRegistry::new()
        .with_index("a", FakeIndex::new("a", vec!["1", "2", "3", "4"]))
        .with_index("b", FakeIndex::new("b", vec!["4", "3", "5"]))
        .with_index("c", FakeIndex::new("c", vec!["6", "1"]));
    let llm = FakeLlm::new(Rewrite::Text("unused"), Generation::Echo);
    let engine = engine(registry, FakeScorer::with(&[("3", 0.5), ("6", 0.5)]), llm.clone());

    let first = done(&collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await).clone();
    for _ in 0..3 {
        let again = done(&collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await).clone();
        assert_eq!(again, first);
    }

    let prompts = llm.prompts.lock().unwrap();
    assert!(prompts.iter().all(|p| p == &prompts[0]));
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A"]));
    let llm = FakeLlm::new(Rewrite::Text("unused"), Generation::Echo);
    let engine = engine(registry, FakeScorer::flat(), llm);

    let first = engine.answer("first question", Vec::new(), AnswerOptions::default());
    let second = engine.answer("second question", Vec::new(), AnswerOptions::default());
    assert_ne!(first.request_id(), second.request_id());

    let (first, second) = tokio::join!(first.final_answer(), second.final_answer());

    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();
    assert!(first.text.contains("Q[first question]"));
    assert!(second.text.contains("Q[second question]"));
}

#[tokio::test]
async fn test_options_override_defaults() {
    let index = FakeIndex::new("a", vec!["A"]);
    let registry = IndexRegistry::new().with_index("a", index.clone());
    let llm = FakeLlm::answering(vec!["ok"]);
    let engine = engine(registry, FakeScorer::flat(), llm.clone());

    let options = AnswerOptions {
        temperature: Some(0.7),
        max_output_tokens: None,
        compute_hint: Some(0),
        category: Some("ddd".to_string()),
    };
    done(&collect(engine.answer("q", Vec::new(), options)).await);

    let params = llm.params.lock().unwrap()[0].clone();
    assert_eq!(params.temperature, 0.7);
    assert_eq!(params.max_output_tokens, 4096);
    assert_eq!(params.compute_hint, Some(0));
    assert_eq!(index.queries()[0].1.as_deref(), Some("ddd"));

    done(&collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await);
    let defaults = llm.params.lock().unwrap()[1].clone();
    assert_eq!(defaults.temperature, 0.2);
    assert_eq!(defaults.compute_hint, Some(35));
}

#[tokio::test]
async fn test_no_indices_is_fatal() {
    let engine = engine(IndexRegistry::new(), FakeScorer::flat(), FakeLlm::answering(vec![]));

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;

    assert_eq!(failure(&events).kind, ErrorKind::AllIndexesFailed);
}

#[tokio::test]
async fn test_json_event_lines() {
    let registry = IndexRegistry::new().with_index("a", FakeIndex::new("a", vec!["A"]));
    let engine = engine(registry, FakeScorer::flat(), FakeLlm::answering(vec!["ok"]));

    let events = collect(engine.answer("q", Vec::new(), AnswerOptions::default())).await;
    let lines: Vec<serde_json::Value> = events
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();

    assert_eq!(lines[0]["event"], "stage");
    assert_eq!(lines[0]["data"], "rewriting");
    let last = lines.last().unwrap();
    assert_eq!(last["event"], "done");
    assert_eq!(last["data"]["text"], "ok");
    assert_eq!(last["data"]["sources"][0]["source_path"], "A.md");
    assert!(last["data"].get("interrupted").is_none());
}
