//! Config loader: reads `~/.modelmux/config.json`, expands `${VAR}`
//! references, applies legacy migrations and env var overrides.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.modelmux/config.json` (or the given path)
//! 3. `${VAR}` / `${VAR:-default}` references inside JSON strings
//! 4. Environment variables `MODELMUX_<SECTION>__<FIELD>` (override JSON)
//!
//! A missing file yields defaults; an unreadable or malformed file is an error.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::schema::{Config, Credential};
use crate::error::ConfigurationError;
use crate::utils::expand_env_in_json;

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from the given path (or the default one) + env vars.
///
/// The result is not validated; call [`Config::validate`] before use.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigurationError> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    load_config_from_path(&config_path)
}

/// Load config from a specific file path.
fn load_config_from_path(path: &Path) -> Result<Config, ConfigurationError> {
    if !path.exists() {
        info!("No config file found at {}, using defaults", path.display());
        return Ok(apply_env_overrides(Config::default()));
    }

    debug!("Loading config from {}", path.display());

    let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    parse_config(&content)
}

/// Parse a JSON config document (expansion, migration, env overrides).
pub fn parse_config(content: &str) -> Result<Config, ConfigurationError> {
    let mut raw: serde_json::Value = serde_json::from_str(content)?;

    expand_env_in_json(&mut raw);
    migrate_config(&mut raw);

    let config: Config = serde_json::from_value(raw)?;
    Ok(apply_env_overrides(config))
}

/// Save configuration to disk (pretty-printed JSON).
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;

    std::fs::write(&config_path, json)?;
    debug!("Config saved to {}", config_path.display());
    Ok(())
}

/// Apply legacy config migrations.
///
/// - `llm.usage_strategy` → `usage_strategy`
/// - `llm.providers` given as an object keyed by id → list with `id` filled in,
///   in file order
fn migrate_config(raw: &mut serde_json::Value) {
    let Some(llm) = raw.get_mut("llm").and_then(|v| v.as_object_mut()) else {
        return;
    };

    let nested_strategy = llm.remove("usage_strategy");

    if let Some(serde_json::Value::Object(map)) = llm.get_mut("providers") {
        let list: Vec<serde_json::Value> = std::mem::take(map)
            .into_iter()
            .map(|(id, mut provider)| {
                if let Some(obj) = provider.as_object_mut() {
                    obj.entry("id").or_insert_with(|| serde_json::Value::String(id));
                }
                provider
            })
            .collect();
        llm.insert("providers".into(), serde_json::Value::Array(list));
        debug!("Migrated llm.providers object → list");
    }

    if let Some(strategy) = nested_strategy {
        if let Some(root) = raw.as_object_mut() {
            if root.get("usage_strategy").is_none() {
                root.insert("usage_strategy".into(), strategy);
                debug!("Migrated llm.usage_strategy → usage_strategy");
            }
        }
    }
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `MODELMUX_<SECTION>__<FIELD>` (double underscore as delimiter).
///
/// Supported overrides:
/// - `MODELMUX_LLM__DEFAULT_PROVIDER` → `llm.default_provider`
/// - `MODELMUX_LLM__TOKEN_COUNTER__DEFAULT_MODEL` → `llm.token_counter.default_model`
/// - `MODELMUX_USAGE_STRATEGY__AUTO_FALLBACK` → `usage_strategy.auto_fallback`
/// - `MODELMUX_PROVIDERS__<ID>__API_KEY` → credentials of provider `<id>`
/// - `MODELMUX_PROVIDERS__<ID>__ENDPOINT` → endpoint of provider `<id>`
/// - `MODELMUX_PROVIDERS__<ID>__MODEL` → model of provider `<id>`
/// - `MODELMUX_PROVIDERS__<ID>__ENABLED` → enabled flag of provider `<id>`
/// - `MODELMUX_STORAGE__HISTORY_DIR` → `storage.history_dir`
///
/// `<ID>` is the provider id upper-cased with `-` replaced by `_`.
fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(val) = std::env::var("MODELMUX_LLM__DEFAULT_PROVIDER") {
        config.llm.default_provider = val;
    }
    if let Ok(val) = std::env::var("MODELMUX_LLM__TOKEN_COUNTER__DEFAULT_MODEL") {
        config.llm.token_counter.default_model = val;
    }
    if let Ok(val) = std::env::var("MODELMUX_USAGE_STRATEGY__AUTO_FALLBACK") {
        config.usage_strategy.auto_fallback = parse_bool(&val);
    }
    if let Ok(val) = std::env::var("MODELMUX_STORAGE__HISTORY_DIR") {
        config.storage.history_dir = Some(val);
    }

    for provider in &mut config.llm.providers {
        let key = env_key(&provider.id);
        if let Ok(val) = std::env::var(format!("MODELMUX_PROVIDERS__{key}__API_KEY")) {
            provider.credentials = Credential::new(val);
        }
        if let Ok(val) = std::env::var(format!("MODELMUX_PROVIDERS__{key}__ENDPOINT")) {
            provider.endpoint = val;
        }
        if let Ok(val) = std::env::var(format!("MODELMUX_PROVIDERS__{key}__MODEL")) {
            provider.model = val;
        }
        if let Ok(val) = std::env::var(format!("MODELMUX_PROVIDERS__{key}__ENABLED")) {
            provider.enabled = parse_bool(&val);
        }
    }

    config
}

fn env_key(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn parse_bool(val: &str) -> bool {
    matches!(val.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
