//! `modelmux count` and `modelmux render`: local, no provider calls.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use modelmux_core::config::Config;
use modelmux_core::template::PromptTemplate;
use modelmux_core::tokens::TokenCounter;

use crate::helpers;

pub fn run_count(config: &Config, model: Option<&str>, text: &str) -> Result<()> {
    let counter = TokenCounter::new(config.llm.token_counter.default_model.clone());
    let model = model.unwrap_or(counter.default_model());

    let tokens = counter
        .count_tokens(text, model)
        .with_context(|| format!("cannot count tokens for '{model}'"))?;
    let encoding = counter.encoding_for(model)?;

    println!("{tokens}");
    let window = counter
        .context_window(model)
        .map(|w| format!(" · context window {w}"))
        .unwrap_or_default();
    eprintln!("{}", format!("{model} ({encoding}){window}").dimmed());
    Ok(())
}

pub fn run_render(file: &Path, vars: &[String]) -> Result<()> {
    print!("{}", render_file(file, vars)?);
    Ok(())
}

fn render_file(file: &Path, vars: &[String]) -> Result<String> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read template {}", file.display()))?;
    let template = PromptTemplate::compile(source)
        .with_context(|| format!("invalid template {}", file.display()))?;
    let vars = helpers::vars_to_json(vars)?;
    Ok(template.render(&vars)?)
}
