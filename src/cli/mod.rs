//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ragline",
    version,
    author = "neur0map",
    about = "Ask questions against your indexed documents",
    long_about = "Ragline rewrites follow-up questions, searches several vector indices in parallel, \
                  fuses and reranks the results, and streams an answer from a local language model \
                  grounded in the best-matching passages."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/ragline/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question and stream the answer
    Ask {
        /// Question to ask
        question: String,

        /// Only use passages from this category (e.g. "ddd", "python")
        #[arg(long)]
        category: Option<String>,

        /// Sampling temperature
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Maximum tokens to generate
        #[arg(long = "max-tokens", value_name = "N")]
        max_tokens: Option<u32>,

        /// Model layers to offload to the GPU
        #[arg(long, value_name = "N")]
        gpu_layers: Option<u32>,

        /// JSON file with earlier turns: [{"user_message": ..., "assistant_message": ...}]
        #[arg(long, value_name = "FILE")]
        history: Option<PathBuf>,

        /// Profile to use (e.g., "cpu", "long")
        #[arg(short, long)]
        profile: Option<String>,

        /// Print every progress event as one JSON line
        #[arg(long)]
        json: bool,
    },

    /// Load every configured index and report its size
    Status {
        /// Profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ask_with_options() {
        let cli = Cli::try_parse_from([
            "ragline",
            "--verbose",
            "ask",
            "What is an aggregate?",
            "--category",
            "ddd",
            "--max-tokens",
            "256",
            "--gpu-layers",
            "0",
            "--json",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Ask {
                question,
                category,
                max_tokens,
                gpu_layers,
                json,
                temperature,
                ..
            } => {
                assert_eq!(question, "What is an aggregate?");
                assert_eq!(category.as_deref(), Some("ddd"));
                assert_eq!(max_tokens, Some(256));
                assert_eq!(gpu_layers, Some(0));
                assert_eq!(temperature, None);
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_config_validate_file() {
        let cli = Cli::try_parse_from(["ragline", "config", "validate", "/tmp/c.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Validate { file: Some(_) }
            }
        ));
    }
}
