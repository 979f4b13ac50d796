//! Configuration schema.
//!
//! Hierarchy: `Config` → `LlmConfig` (providers, default provider, token
//! counter), `UsageStrategy` (task routing, auto fallback, failover policy),
//! `StorageConfig`.
//!
//! JSON on disk uses the same snake_case keys as the Rust fields. Durations are
//! given in seconds and may be fractional.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigurationError;
use crate::utils::duration_secs;

// ─────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────

/// Root configuration: loaded from `~/.modelmux/config.json` + env vars.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub usage_strategy: UsageStrategy,
    pub storage: StorageConfig,
}

impl Config {
    /// Look up a provider by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.llm.providers.iter().find(|p| p.id == id)
    }

    /// Check every startup invariant; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.llm.providers.is_empty() {
            return Err(ConfigurationError::Invalid(
                "no providers configured under llm.providers".into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.llm.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigurationError::Invalid("provider with empty id".into()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigurationError::DuplicateProvider {
                    id: provider.id.clone(),
                });
            }
            if provider.enabled && provider.model.trim().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "provider '{}' has no model",
                    provider.id
                )));
            }
            if provider.endpoint.trim().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "provider '{}' has no endpoint",
                    provider.id
                )));
            }
            if provider.embedding_dimensions == Some(0) {
                return Err(ConfigurationError::Invalid(format!(
                    "provider '{}' has embedding_dimensions = 0",
                    provider.id
                )));
            }
        }

        if self.llm.default_provider.is_empty() {
            return Err(ConfigurationError::Invalid("llm.default_provider is not set".into()));
        }
        if !seen.contains(self.llm.default_provider.as_str()) {
            return Err(ConfigurationError::UnknownProvider {
                id: self.llm.default_provider.clone(),
                referenced_by: "llm.default_provider".into(),
            });
        }

        for (task, targets) in &self.usage_strategy.task_routing {
            if targets.ids().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "task '{task}' routes to an empty provider list"
                )));
            }
            for id in targets.ids() {
                if !seen.contains(id.as_str()) {
                    return Err(ConfigurationError::UnknownProvider {
                        id: id.clone(),
                        referenced_by: format!("usage_strategy.task_routing.{task}"),
                    });
                }
            }
        }

        for (i, rule) in self.usage_strategy.model_rules.iter().enumerate() {
            if !seen.contains(rule.provider.as_str()) {
                return Err(ConfigurationError::UnknownProvider {
                    id: rule.provider.clone(),
                    referenced_by: format!("usage_strategy.model_rules[{i}]"),
                });
            }
            if let (Some(min), Some(max)) = (rule.condition.min_tokens, rule.condition.max_tokens) {
                if min > max {
                    return Err(ConfigurationError::Invalid(format!(
                        "usage_strategy.model_rules[{i}]: min_tokens {min} exceeds max_tokens {max}"
                    )));
                }
            }
        }

        self.usage_strategy.failover.validate()
    }
}

// ─────────────────────────────────────────────
// LLM section
// ─────────────────────────────────────────────

/// `llm` section: provider pool, default provider and token counter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider used when a task has no route, and the last-resort candidate.
    pub default_provider: String,
    pub token_counter: TokenCounterConfig,
    /// Ordered provider list.
    pub providers: Vec<ProviderConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCounterConfig {
    /// Model whose tokenizer is used when a provider's model has no rule.
    pub default_model: String,
}

impl Default for TokenCounterConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-3.5-turbo".to_string(),
        }
    }
}

// ─────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────

/// Vendor protocol spoken by a provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai_compatible", alias = "openai", alias = "openai-compatible")]
    OpenAiCompatible,
    #[serde(alias = "azure_openai")]
    Azure,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAiCompatible => f.write_str("openai_compatible"),
            ProviderKind::Azure => f.write_str("azure"),
        }
    }
}

/// API credential. Redacted in `Debug`; serialized as-is so configs round-trip.
#[derive(Default)]
pub struct Credential(Option<SecretString>);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Self(None)
        } else {
            Self(Some(SecretString::from(value)))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The raw secret, for building request headers.
    pub fn expose(&self) -> &str {
        self.0.as_ref().map(|s| s.expose_secret()).unwrap_or("")
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential(<redacted>)")
        }
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<String>::deserialize(deserializer).map(|v| Self::new(v.unwrap_or_default()))
    }
}

/// Immutable description of one configured backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Unique key used by routing.
    pub id: String,
    /// Vendor protocol.
    #[serde(alias = "type")]
    pub kind: ProviderKind,
    /// Display name for logs and usage metadata (defaults to `id`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub enabled: bool,
    /// Chat model (Azure: deployment name).
    pub model: String,
    #[serde(alias = "api_key")]
    pub credentials: Credential,
    /// Base URL (OpenAI-compatible: up to `/v1`; Azure: resource URL).
    #[serde(alias = "api_base")]
    pub endpoint: String,
    /// Per-attempt timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_retries: u32,
    /// Linear delay between attempts against this provider.
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    /// Expected embedding vector length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<usize>,
    /// Default output cap when the caller gives none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Overrides the token counter's context size table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    /// Azure `api-version` query parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<HashMap<String, String>>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: ProviderKind::default(),
            name: None,
            enabled: true,
            model: String::new(),
            credentials: Credential::default(),
            endpoint: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            embedding_model: None,
            embedding_dimensions: None,
            max_tokens: None,
            temperature: None,
            context_window: None,
            api_version: None,
            extra_headers: None,
        }
    }
}

impl ProviderConfig {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ─────────────────────────────────────────────
// Usage strategy
// ─────────────────────────────────────────────

/// One routing-table entry: a single provider id or an ordered list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteTargets {
    Single(String),
    Ordered(Vec<String>),
}

impl RouteTargets {
    pub fn ids(&self) -> &[String] {
        match self {
            RouteTargets::Single(id) => std::slice::from_ref(id),
            RouteTargets::Ordered(ids) => ids,
        }
    }
}

/// `usage_strategy` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageStrategy {
    /// Fail over to later candidates and put failing providers in cooldown.
    pub auto_fallback: bool,
    /// Task name → provider id(s), primary first.
    pub task_routing: BTreeMap<String, RouteTargets>,
    /// Extra candidates chosen by request shape, after the routed ids.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub model_rules: Vec<ModelRule>,
    /// Order in which a request's candidates are tried.
    pub balancing: BalanceStrategy,
    pub failover: FailoverPolicy,
}

impl Default for UsageStrategy {
    fn default() -> Self {
        Self {
            auto_fallback: true,
            task_routing: BTreeMap::new(),
            model_rules: Vec::new(),
            balancing: BalanceStrategy::default(),
            failover: FailoverPolicy::default(),
        }
    }
}

/// Spreads requests over a pool of equivalent providers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    /// Routing order, primary first.
    #[default]
    Ordered,
    /// Rotate the candidate list by one per request, per task.
    RoundRobin,
    /// A random candidate first, the rest in routing order.
    Random,
    /// Fewest recorded calls first.
    LeastUsed,
}

impl fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BalanceStrategy::Ordered => "ordered",
            BalanceStrategy::RoundRobin => "round_robin",
            BalanceStrategy::Random => "random",
            BalanceStrategy::LeastUsed => "least_used",
        })
    }
}

/// Adds `provider` to the candidates of requests matching `condition`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRule {
    #[serde(alias = "model_id")]
    pub provider: String,
    #[serde(default)]
    pub condition: RuleCondition,
}

/// Every present field must hold for a rule to match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Lower bound on the request's `max_tokens`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_tokens: Option<u32>,
    /// Upper bound on the request's `max_tokens`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl RuleCondition {
    /// Token bounds are ignored when the request sets no `max_tokens`.
    pub fn matches(&self, task: &str, max_tokens: Option<u32>) -> bool {
        if self.task.as_deref().is_some_and(|t| t != task) {
            return false;
        }
        let Some(requested) = max_tokens else {
            return true;
        };
        self.min_tokens.map_or(true, |min| requested >= min)
            && self.max_tokens.map_or(true, |max| requested <= max)
    }
}

/// How cooldown length grows with repeated failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownGrowth {
    Linear,
    #[default]
    Exponential,
}

/// Error threshold and cooldown schedule for auto fallback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverPolicy {
    /// Consecutive exhausted-retry failures before a provider enters cooldown.
    pub error_threshold: u32,
    #[serde(with = "duration_secs")]
    pub base_cooldown: Duration,
    #[serde(with = "duration_secs")]
    pub max_cooldown: Duration,
    pub growth: CooldownGrowth,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
            growth: CooldownGrowth::Exponential,
        }
    }
}

impl FailoverPolicy {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.error_threshold == 0 {
            return Err(ConfigurationError::Invalid(
                "usage_strategy.failover.error_threshold must be at least 1".into(),
            ));
        }
        if self.base_cooldown > self.max_cooldown {
            return Err(ConfigurationError::Invalid(
                "usage_strategy.failover.base_cooldown exceeds max_cooldown".into(),
            ));
        }
        Ok(())
    }

    /// Cooldown for a provider with `consecutive_errors` failures, or `None`
    /// while it is still under the threshold.
    ///
    /// The first cooldown lasts `base_cooldown`; each further failure grows it
    /// linearly or by doubling, capped at `max_cooldown`.
    pub fn cooldown_for(&self, consecutive_errors: u32) -> Option<Duration> {
        if consecutive_errors < self.error_threshold {
            return None;
        }
        let step = consecutive_errors - self.error_threshold;
        let cooldown = match self.growth {
            CooldownGrowth::Linear => self.base_cooldown.saturating_mul(step.saturating_add(1)),
            CooldownGrowth::Exponential => {
                let factor = 1u32.checked_shl(step.min(31)).unwrap_or(u32::MAX);
                self.base_cooldown.saturating_mul(factor)
            }
        };
        Some(cooldown.min(self.max_cooldown))
    }
}

// ─────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────

/// `storage` section.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for JSONL conversation history (default `~/.modelmux/history`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_dir: Option<String>,
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
