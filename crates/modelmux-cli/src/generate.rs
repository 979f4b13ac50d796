//! `modelmux generate` and `modelmux embed`.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use modelmux_core::config::Config;
use modelmux_router::RequestOptions;

use crate::helpers;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Prompt text
    #[arg(short, long)]
    pub prompt: String,

    /// Task used to pick providers
    #[arg(short, long, default_value = "chat")]
    pub task: String,

    /// Cap on reply tokens
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Model to use instead of each provider's configured one
    #[arg(long)]
    pub model: Option<String>,

    /// Overall deadline in seconds
    #[arg(long)]
    pub deadline: Option<u64>,

    /// Record the exchange under this conversation id
    #[arg(long)]
    pub conversation: Option<String>,
}

impl GenerateArgs {
    fn options(&self) -> RequestOptions {
        let mut options = RequestOptions::new();
        options.generate.max_tokens = self.max_tokens;
        options.generate.temperature = self.temperature;
        options.generate.model_override = self.model.clone();
        options.deadline = self.deadline.map(Duration::from_secs);
        options.conversation_id = self.conversation.clone();
        options
    }
}

pub async fn run_generate(config: &Config, args: GenerateArgs) -> Result<()> {
    let manager = crate::build_manager(config)?;
    let options = args.options();

    info!(task = %args.task, "generating");
    let generation = manager
        .generate_text(args.prompt.as_str(), &args.task, &options)
        .await
        .context("generation failed")?;

    helpers::print_generation(&generation.text);
    helpers::print_usage(&generation.usage);
    Ok(())
}

pub async fn run_embed(config: &Config, text: &str, task: &str) -> Result<()> {
    let manager = crate::build_manager(config)?;
    let embedding = manager
        .generate_embedding(text, task, &RequestOptions::new())
        .await
        .context("embedding failed")?;

    println!("{}", helpers::preview_vector(&embedding.vector, 8));
    helpers::print_usage(&embedding.usage);
    Ok(())
}
