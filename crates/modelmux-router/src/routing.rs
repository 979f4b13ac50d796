//! Task → ordered candidate provider list.

use std::collections::{BTreeMap, HashSet};

use modelmux_core::config::{Config, ModelRule, RouteTargets};

/// Resolves a task name to provider ids: routed ids first (primary, then
/// fallbacks), then the targets of matching model rules, then the default
/// provider, duplicates removed in first-seen order.
#[derive(Clone, Debug, Default)]
pub struct TaskRoutingTable {
    routes: BTreeMap<String, Vec<String>>,
    rules: Vec<ModelRule>,
    default_provider: Option<String>,
}

impl TaskRoutingTable {
    pub fn new(routes: BTreeMap<String, Vec<String>>, default_provider: Option<String>) -> Self {
        Self {
            routes,
            rules: Vec::new(),
            default_provider: default_provider.filter(|d| !d.is_empty()),
        }
    }

    pub fn with_rules(mut self, rules: Vec<ModelRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        let routes = config
            .usage_strategy
            .task_routing
            .iter()
            .map(|(task, targets)| (task.clone(), targets.ids().to_vec()))
            .collect();
        Self::new(routes, Some(config.llm.default_provider.clone()))
            .with_rules(config.usage_strategy.model_rules.clone())
    }

    /// Whether `task` has an explicit route.
    pub fn is_routed(&self, task: &str) -> bool {
        self.routes.contains_key(task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn rules(&self) -> &[ModelRule] {
        &self.rules
    }

    /// Ordered, de-duplicated provider ids for `task`, whatever the request size.
    pub fn candidates(&self, task: &str) -> Vec<&str> {
        self.resolve(task, None)
    }

    /// Ordered, de-duplicated provider ids for a request on `task` asking for
    /// up to `max_tokens`.
    pub fn resolve(&self, task: &str, max_tokens: Option<u32>) -> Vec<&str> {
        let routed = self.routes.get(task).map(Vec::as_slice).unwrap_or(&[]);
        let ruled = self
            .rules
            .iter()
            .filter(|rule| rule.condition.matches(task, max_tokens))
            .map(|rule| rule.provider.as_str());

        let mut seen = HashSet::new();
        routed
            .iter()
            .map(String::as_str)
            .chain(ruled)
            .chain(self.default_provider.as_deref())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

impl From<&BTreeMap<String, RouteTargets>> for TaskRoutingTable {
    fn from(routes: &BTreeMap<String, RouteTargets>) -> Self {
        Self::new(
            routes
                .iter()
                .map(|(task, targets)| (task.clone(), targets.ids().to_vec()))
                .collect(),
            None,
        )
    }
}
