use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Route completions across OpenAI, Anthropic and Gemini")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single completion and print the answer
    Complete {
        #[command(flatten)]
        request: RequestArgs,

        /// Ask every enabled provider and keep the best-scoring answer
        #[arg(short, long)]
        ensemble: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream a completion to stdout as it arrives
    Stream {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// List models served by enabled providers
    Models,

    /// Show provider status and rate windows
    Status,

    /// Manage API keys in the OS keychain
    ApiKey {
        /// Provider name (openai, anthropic, gemini)
        provider: String,

        /// Set API key for provider
        #[arg(short, long, conflicts_with = "remove")]
        set: Option<String>,

        /// Remove API key for provider
        #[arg(short, long)]
        remove: bool,
    },

    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Prompt text
    pub prompt: String,

    /// Pin a model (e.g. gpt-4o, claude-3.5-sonnet); chosen automatically otherwise
    #[arg(short, long)]
    pub model: Option<String>,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    #[arg(short, long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Attach a file as context (repeatable)
    #[arg(short, long = "file")]
    pub files: Vec<PathBuf>,
}
