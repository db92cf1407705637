use futures_util::StreamExt;
use ragline::cli::{Cli, Commands, ConfigAction};
use ragline::config::{Config, ConfigValidator};
use ragline::error::{RaglineError, Result};
use ragline::index::IndexRegistry;
use ragline::pipeline::{Answer, AnswerOptions, ConversationTurn, ProgressEvent, RagEngine};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Ask {
            question,
            category,
            temperature,
            max_tokens,
            gpu_layers,
            history,
            profile,
            json,
        } => {
            let options = AnswerOptions {
                temperature,
                max_output_tokens: max_tokens,
                compute_hint: gpu_layers,
                category,
            };
            cmd_ask(cli.config, profile, &question, history, options, json)?;
        }
        Commands::Status { profile } => {
            cmd_status(cli.config, profile)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries only the answer
fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "ragline=debug" } else { "ragline=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| RaglineError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })
}

fn cmd_ask(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    question: &str,
    history_file: Option<PathBuf>,
    options: AnswerOptions,
    json: bool,
) -> Result<()> {
    if question.trim().is_empty() {
        return Err(RaglineError::Config("Question must not be empty".to_string()));
    }

    let config = load_config(config_path, profile)?;
    let history = match history_file {
        Some(path) => read_history(&path)?,
        None => Vec::new(),
    };

    let rt = runtime()?;
    // Model loading blocks; do it before entering the runtime
    let engine = Arc::new(RagEngine::from_config(&config)?);

    rt.block_on(stream_answer(engine, question, history, options, json))
}

async fn stream_answer(
    engine: Arc<RagEngine>,
    question: &str,
    history: Vec<ConversationTurn>,
    options: AnswerOptions,
    json: bool,
) -> Result<()> {
    let mut stream = engine.answer(question, history, options);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut printed = 0usize;
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = &mut ctrl_c => {
                stream.cancel();
                eprintln!("\n✗ Cancelled");
                return Ok(());
            }
        };

        let Some(event) = event else {
            return Ok(());
        };

        if json {
            let line = serde_json::to_string(&event).map_err(|e| RaglineError::Json {
                source: e,
                context: "Failed to serialize progress event".to_string(),
            })?;
            println!("{line}");
            if let ProgressEvent::Error(failure) = event {
                return Err(anyhow::anyhow!("{}: {}", failure.kind, failure.message).into());
            }
            continue;
        }

        match event {
            ProgressEvent::Stage(stage) => tracing::debug!("{}...", stage),
            ProgressEvent::Partial(text) => {
                print!("{}", text.get(printed..).unwrap_or_default());
                printed = text.len();
                stdout.flush().ok();
            }
            ProgressEvent::Done(answer) => {
                print_answer_tail(&answer, printed);
                return Ok(());
            }
            ProgressEvent::Error(failure) => {
                return Err(anyhow::anyhow!("{}: {}", failure.kind, failure.message).into());
            }
        }
    }
}

fn print_answer_tail(answer: &Answer, printed: usize) {
    let rendered = answer.rendered();
    println!("{}", rendered.get(printed..).unwrap_or_default());

    if answer.sources.is_empty() {
        println!("\nNo sources were found for this question.");
        return;
    }

    println!("\nSources:");
    for (i, source) in answer.sources.iter().enumerate() {
        println!(
            "  {}. {} [{}] via {} (score {:.3})",
            i + 1,
            source.source_path,
            source.category,
            source.index_key,
            source.relevance_score
        );
    }
}

fn read_history(path: &Path) -> Result<Vec<ConversationTurn>> {
    let content = std::fs::read_to_string(path).map_err(|e| RaglineError::Io {
        source: e,
        context: format!("Failed to read history file: {:?}", path),
    })?;
    serde_json::from_str(&content).map_err(|e| RaglineError::Json {
        source: e,
        context: format!("Invalid history file: {:?}", path),
    })
}

fn cmd_status(config_path: Option<PathBuf>, profile: Option<String>) -> Result<()> {
    let config = load_config(config_path, profile)?;
    let registry = IndexRegistry::from_config(&config)?;

    println!("Ragline Status");
    println!("==============");
    println!("\nModel: {} @ {}", config.llm.model, config.llm.endpoint);
    println!(
        "Context: {} tokens ({} for retrieved passages)",
        config.llm.context_window,
        config.llm.context_budget()
    );
    println!("Reranker: {}", config.retrieval.reranker_model);

    let status = runtime()?.block_on(registry.status());

    println!("\nIndices: {} configured", status.len());
    for (key, result) in status {
        match result {
            Ok(chunks) => println!("  ✓ {key}: {chunks} chunks"),
            Err(e) => println!("  ✗ {key}: {e}"),
        }
    }

    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, None)?;
            let json = serde_json::to_string_pretty(&config).map_err(|e| RaglineError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;
            println!("{}", json);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            println!("  Indices: {}", config.indices.len());
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RaglineError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;

            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'ragline config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    if let Some(profile) = profile {
        Config::load_with_profile(&path, &profile)
    } else {
        Config::load(&path)
    }
}
