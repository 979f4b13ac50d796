//! Modelmux CLI: entry point.
//!
//! # Commands
//!
//! - `modelmux generate -p PROMPT [-t TASK]`: routed text generation
//! - `modelmux embed -t TEXT`: routed embedding
//! - `modelmux count [-m MODEL] TEXT`: token counting
//! - `modelmux render FILE --var k=v`: prompt template rendering
//! - `modelmux status [--probe]`: provider health

mod generate;
mod helpers;
mod status;
mod text;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use modelmux_core::config::{load_config, Config};
use modelmux_core::storage::JsonlHistoryStore;
use modelmux_core::utils::expand_home;
use modelmux_router::LlmManager;

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// Modelmux: route LLM requests across providers with fail-over
#[derive(Parser)]
#[command(name = "modelmux", version, about, long_about = None)]
struct Cli {
    /// Config file (default ~/.modelmux/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, default_value_t = false)]
    logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text through the router
    Generate(generate::GenerateArgs),

    /// Embed text through the router
    Embed {
        /// Text to embed
        #[arg(short, long)]
        text: String,

        /// Task used to pick providers
        #[arg(long, default_value = "embeddings")]
        task: String,
    },

    /// Count tokens for a model
    Count {
        /// Model whose tokenizer to use (default: llm.token_counter.default_model)
        #[arg(short, long)]
        model: Option<String>,

        /// Text to count
        text: String,
    },

    /// Render a prompt template file
    Render {
        /// Template file
        file: PathBuf,

        /// Variable as key=value (value parsed as JSON when possible)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Show provider configuration and health
    Status {
        /// Run each provider's health check first
        #[arg(long, default_value_t = false)]
        probe: bool,
    },
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.logs);

    let config_path = cli.config.as_deref().map(helpers::expand_tilde);
    let config = read_config(config_path.as_deref())?;

    match cli.command {
        Commands::Generate(args) => generate::run_generate(&config, args).await,
        Commands::Embed { text, task } => generate::run_embed(&config, &text, &task).await,
        Commands::Count { model, text } => text::run_count(&config, model.as_deref(), &text),
        Commands::Render { file, vars } => text::run_render(&helpers::expand_tilde(&file), &vars),
        Commands::Status { probe } => status::run(&config, probe).await,
    }
}

fn read_config(path: Option<&Path>) -> Result<Config> {
    let config = load_config(path).context("failed to load configuration")?;
    debug!(providers = config.llm.providers.len(), "Configuration loaded");
    Ok(config)
}

/// Build the router, attaching the JSONL history store.
pub fn build_manager(config: &Config) -> Result<LlmManager> {
    let manager = LlmManager::from_config(config).context("invalid provider configuration")?;

    let history_dir = config.storage.history_dir.as_deref().map(expand_home);
    let store = JsonlHistoryStore::new(history_dir).context("failed to create history directory")?;
    Ok(manager.with_history(Arc::new(store)))
}

/// Initialize tracing/logging.
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("modelmux=debug,info")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
