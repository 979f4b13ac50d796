//! Shared CLI helpers: variable parsing and result printing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use colored::Colorize;
use serde_json::{Map, Value};

use modelmux_core::types::UsageMetadata;

/// Expand a leading `~` in a user-supplied path (quoted paths reach us unexpanded).
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    match (raw.strip_prefix("~/"), raw == "~", dirs_next::home_dir()) {
        (Some(rest), _, Some(home)) => home.join(rest),
        (None, true, Some(home)) => home,
        _ => path.to_path_buf(),
    }
}

/// Parse `key=value`. The value is read as JSON when it parses, otherwise
/// kept as a plain string.
pub fn parse_var(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected KEY=VALUE, got '{raw}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("empty variable name in '{raw}'");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Collect `--var` flags into one JSON object; later flags win.
pub fn vars_to_json(raw: &[String]) -> Result<Value> {
    let mut vars = Map::new();
    for item in raw {
        let (key, value) = parse_var(item)?;
        vars.insert(key, value);
    }
    Ok(Value::Object(vars))
}

pub fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 1 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// First `n` components of a vector, then its length.
pub fn preview_vector(vector: &[f32], n: usize) -> String {
    let shown: Vec<String> = vector.iter().take(n).map(|x| format!("{x:.4}")).collect();
    let more = if vector.len() > n { ", …" } else { "" };
    format!("[{}{}] ({} dims)", shown.join(", "), more, vector.len())
}

pub fn print_generation(text: &str) {
    println!();
    if text.is_empty() {
        println!("{}", "(empty response)".dimmed());
    } else {
        println!("{text}");
    }
    println!();
}

/// Usage line on stderr so stdout stays pipeable.
pub fn print_usage(usage: &UsageMetadata) {
    let tokens = format!(
        "{} prompt + {} completion = {} tokens{}",
        usage.prompt_tokens,
        usage.completion_tokens,
        usage.total_tokens,
        if usage.estimated { " (estimated)" } else { "" }
    );
    eprintln!(
        "{} {} · {} · {} · {} attempt(s) · {}",
        "↳".dimmed(),
        usage.provider_name.cyan(),
        usage.model,
        tokens.dimmed(),
        usage.attempts,
        format_duration(usage.latency).dimmed()
    );
}
