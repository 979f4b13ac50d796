//! `modelmux status`: show configuration and provider health.

use anyhow::Result;
use colored::Colorize;

use modelmux_core::config::{get_config_path, Config, RuleCondition};
use modelmux_router::{HealthState, ProbeReport, ProviderStatus};

use crate::helpers::format_duration;

/// Run the status command.
pub async fn run(config: &Config, probe: bool) -> Result<()> {
    let manager = crate::build_manager(config)?;

    let config_path = get_config_path();
    println!();
    println!("{}", "Modelmux Status".cyan().bold());
    println!();
    println!(
        "  {:<18} {} {}",
        "Config:".bold(),
        config_path.display(),
        if config_path.exists() {
            "✓".green().to_string()
        } else {
            "(not found)".red().to_string()
        }
    );
    println!("  {:<18} {}", "Default provider:".bold(), config.llm.default_provider);
    println!(
        "  {:<18} {}",
        "Auto fallback:".bold(),
        if config.usage_strategy.auto_fallback { "on" } else { "off" }
    );
    println!("  {:<18} {}", "Balancing:".bold(), manager.balancing());

    let reports = if probe { manager.probe_health().await } else { Vec::new() };

    println!();
    println!("  {}", "Providers:".bold());
    for status in manager.status() {
        let report = reports.iter().find(|r| r.provider_id == status.id);
        println!("    {}", provider_line(&status, report));
    }

    let tasks: Vec<&str> = manager.routing().tasks().collect();
    if !tasks.is_empty() {
        println!();
        println!("  {}", "Routing:".bold());
        for task in tasks {
            println!("    {:<16} {}", task, manager.routing().candidates(task).join(" → "));
        }
    }

    let rules = manager.routing().rules();
    if !rules.is_empty() {
        println!();
        println!("  {}", "Model rules:".bold());
        for rule in rules {
            println!("    {:<16} {}", rule.provider, describe_condition(&rule.condition).dimmed());
        }
    }
    println!();
    Ok(())
}

fn describe_condition(condition: &RuleCondition) -> String {
    let mut parts = Vec::new();
    if let Some(task) = &condition.task {
        parts.push(format!("task = {task}"));
    }
    if let Some(min) = condition.min_tokens {
        parts.push(format!("max_tokens ≥ {min}"));
    }
    if let Some(max) = condition.max_tokens {
        parts.push(format!("max_tokens ≤ {max}"));
    }
    if parts.is_empty() {
        "always".to_string()
    } else {
        parts.join(", ")
    }
}

fn provider_line(status: &ProviderStatus, report: Option<&ProbeReport>) -> String {
    let state = if !status.enabled {
        "disabled".dimmed().to_string()
    } else {
        match status.state {
            HealthState::Healthy => "healthy".green().to_string(),
            HealthState::Degraded => "degraded".yellow().to_string(),
            HealthState::Cooldown => {
                let left = status.cooldown_remaining.map(format_duration).unwrap_or_default();
                format!("{} {}", "cooldown".red(), left.dimmed())
            }
        }
    };

    let probe = match report {
        Some(r) if r.healthy => format!(" {} {}", "✓ probe".green(), format_duration(r.latency).dimmed()),
        Some(_) => format!(" {}", "✗ probe".red()),
        None => String::new(),
    };

    format!(
        "{:<16} {:<18} {:<24} {}{}",
        status.id,
        status.kind.to_string().dimmed(),
        status.model,
        state,
        probe
    )
}
