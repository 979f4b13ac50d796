//! LLM manager: provider registry, task routing and fail-over.
//!
//! One logical request walks its candidate list in order. Each candidate gets
//! up to `max_retries + 1` attempts (one while on trial after a cooldown);
//! only transient errors are retried. Every attempt is bounded by the
//! provider's `timeout`, and the whole walk by the caller's deadline and
//! cancellation token.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use modelmux_core::config::{BalanceStrategy, Config, FailoverPolicy, ProviderConfig};
use modelmux_core::error::{ConfigurationError, ProviderError, ProviderErrorKind};
use modelmux_core::storage::HistoryStore;
use modelmux_core::tokens::TokenCounter;
use modelmux_core::types::{
    EmbeddingGeneration, GenerateOptions, Prompt, Role, TextGeneration, UsageMetadata,
};
use modelmux_providers::{build_adapter, ProviderAdapter};

use crate::balance::Balancer;
use crate::error::{CandidateFailure, RouterError};
use crate::health::{Admission, ProbeReport, ProviderRuntimeState, ProviderStatus};
use crate::operation::{EmbeddingRequest, Operation, TextRequest};
use crate::options::RequestOptions;
use crate::routing::TaskRoutingTable;

// ─────────────────────────────────────────────
// Provider slot
// ─────────────────────────────────────────────

struct ProviderSlot {
    config: Arc<ProviderConfig>,
    adapter: Arc<dyn ProviderAdapter>,
    state: Mutex<ProviderRuntimeState>,
}

impl ProviderSlot {
    /// Lock the runtime state. Never hold the guard across an `.await`.
    fn state(&self) -> MutexGuard<'_, ProviderRuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the trial slot if the call is abandoned before a verdict.
struct TrialPermit<'a> {
    slot: &'a ProviderSlot,
    armed: bool,
}

impl<'a> TrialPermit<'a> {
    fn new(slot: &'a ProviderSlot, armed: bool) -> Self {
        Self { slot, armed }
    }

    fn settle(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.state().release_trial();
        }
    }
}

// ─────────────────────────────────────────────
// LlmManager
// ─────────────────────────────────────────────

/// Routes generation and embedding requests across the configured providers.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct LlmManager {
    slots: Vec<ProviderSlot>,
    routing: TaskRoutingTable,
    balancer: Balancer,
    auto_fallback: bool,
    policy: FailoverPolicy,
    tokens: TokenCounter,
    history: Option<Arc<dyn HistoryStore>>,
}

impl LlmManager {
    /// Validate `config` and build an HTTP adapter for every provider.
    pub fn from_config(config: &Config) -> Result<Self, RouterError> {
        Self::with_adapters(config, build_adapter)
    }

    /// Like [`from_config`](Self::from_config) with a caller-supplied adapter
    /// constructor.
    pub fn with_adapters<F>(config: &Config, mut make_adapter: F) -> Result<Self, RouterError>
    where
        F: FnMut(Arc<ProviderConfig>) -> Result<Arc<dyn ProviderAdapter>, ConfigurationError>,
    {
        config.validate()?;

        let tokens = TokenCounter::new(config.llm.token_counter.default_model.clone());
        tokens.encoding_for(tokens.default_model())?;

        let mut slots = Vec::with_capacity(config.llm.providers.len());
        for provider in &config.llm.providers {
            let provider = Arc::new(provider.clone());
            let adapter = make_adapter(provider.clone())?;
            info!(
                provider = %provider.id,
                kind = %provider.kind,
                model = %provider.model,
                enabled = provider.enabled,
                "Registered provider"
            );
            slots.push(ProviderSlot {
                config: provider,
                adapter,
                state: Mutex::new(ProviderRuntimeState::default()),
            });
        }

        Ok(Self {
            slots,
            routing: TaskRoutingTable::from_config(config),
            balancer: Balancer::new(config.usage_strategy.balancing),
            auto_fallback: config.usage_strategy.auto_fallback,
            policy: config.usage_strategy.failover.clone(),
            tokens,
            history: None,
        })
    }

    /// Record conversation turns to `store` for requests with a conversation id.
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn token_counter(&self) -> &TokenCounter {
        &self.tokens
    }

    pub fn routing(&self) -> &TaskRoutingTable {
        &self.routing
    }

    pub fn balancing(&self) -> BalanceStrategy {
        self.balancer.strategy()
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.slots.iter().map(|s| s.config.as_ref())
    }

    fn slot(&self, id: &str) -> Option<&ProviderSlot> {
        self.slots.iter().find(|s| s.config.id == id)
    }

    /// Enabled providers for a request on `task`, in routing order.
    fn candidates(&self, task: &str, max_tokens: Option<u32>) -> Vec<&ProviderSlot> {
        self.routing
            .resolve(task, max_tokens)
            .into_iter()
            .filter_map(|id| self.slot(id))
            .filter(|s| s.config.enabled)
            .collect()
    }

    // ── Entry points ──

    /// Generate text for `prompt`, routed by `task`.
    pub async fn generate_text(
        &self,
        prompt: impl Into<Prompt>,
        task: &str,
        options: &RequestOptions,
    ) -> Result<TextGeneration, RouterError> {
        let prompt = prompt.into();
        let generation = self.route(task, &TextRequest { prompt: &prompt }, options).await?;

        if let (Some(conversation_id), Some(store)) = (&options.conversation_id, &self.history) {
            // Detached: a slow store never holds up the reply.
            tokio::spawn(record_history(
                store.clone(),
                conversation_id.clone(),
                prompt.last_user_text().map(str::to_owned),
                generation.text.clone(),
                generation.usage.clone(),
            ));
        }
        Ok(generation)
    }

    /// Embed `text`, routed by `task`.
    pub async fn generate_embedding(
        &self,
        text: &str,
        task: &str,
        options: &RequestOptions,
    ) -> Result<EmbeddingGeneration, RouterError> {
        self.route(task, &EmbeddingRequest { text }, options).await
    }

    // ── Routing ──

    async fn route<O: Operation>(
        &self,
        task: &str,
        op: &O,
        options: &RequestOptions,
    ) -> Result<O::Output, RouterError> {
        let attempts = AtomicU32::new(0);
        let walk = self.walk_candidates(task, op, &options.generate, &attempts);

        let bounded = async {
            match options.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, walk).await {
                    Ok(result) => result,
                    Err(_) => {
                        let attempts = attempts.load(Ordering::Relaxed);
                        warn!(task, attempts, ?deadline, "Request deadline exceeded");
                        Err(RouterError::DeadlineExceeded {
                            task: task.to_string(),
                            attempts,
                        })
                    }
                },
                None => walk.await,
            }
        };

        match &options.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(task, "Request cancelled");
                    Err(RouterError::Cancelled { task: task.to_string() })
                }
                result = bounded => result,
            },
            None => bounded.await,
        }
    }

    async fn walk_candidates<O: Operation>(
        &self,
        task: &str,
        op: &O,
        options: &GenerateOptions,
        attempts: &AtomicU32,
    ) -> Result<O::Output, RouterError> {
        let mut candidates = self.candidates(task, options.max_tokens);
        if candidates.is_empty() {
            return Err(RouterError::NoProviderAvailable {
                task: task.to_string(),
                reason: "no enabled provider is routed for this task".into(),
            });
        }

        let now = Instant::now();
        if candidates.iter().all(|s| s.state().in_cooldown(now)) {
            return Err(RouterError::NoProviderAvailable {
                task: task.to_string(),
                reason: "every candidate is cooling down".into(),
            });
        }
        self.balancer
            .arrange(task, &mut candidates, |s| s.state().total_calls);
        if !self.auto_fallback {
            candidates.truncate(1);
        }
        debug!(
            task,
            candidates = ?candidates.iter().map(|s| s.config.id.as_str()).collect::<Vec<_>>(),
            "Resolved candidates"
        );

        let policy = self.auto_fallback.then_some(&self.policy);
        let mut failures = Vec::new();

        for slot in candidates {
            let provider = slot.config.id.as_str();
            let admission = slot.state().admit(Instant::now());
            let max_attempts = match admission {
                Admission::Rejected => {
                    debug!(provider, task, "Skipping provider in cooldown");
                    continue;
                }
                Admission::Trial => {
                    info!(provider, task, "Cooldown elapsed, admitting trial call");
                    1
                }
                Admission::Normal => slot.config.max_retries.saturating_add(1),
            };
            let mut permit = TrialPermit::new(slot, admission == Admission::Trial);

            if let Err(error) = op.preflight(&slot.config, &self.tokens, options) {
                warn!(provider, task, error = %error, "Provider skipped before dispatch");
                failures.push(CandidateFailure {
                    provider_id: provider.to_string(),
                    attempts: 0,
                    error,
                });
                continue;
            }

            match self.attempt(slot, op, options, max_attempts, attempts).await {
                Ok((mut output, used, latency)) => {
                    slot.state().record_success(latency);
                    permit.settle();
                    self.finish_usage(op, slot, task, used, latency, &mut output);
                    debug!(provider, task, attempts = used, ?latency, "Request succeeded");
                    return Ok(output);
                }
                Err((error, used)) => {
                    if error.kind != ProviderErrorKind::InvalidRequest {
                        let cooldown = slot.state().record_failure(Instant::now(), policy, &error);
                        permit.settle();
                        if let Some(cooldown) = cooldown {
                            warn!(provider, ?cooldown, "Provider entering cooldown");
                        }
                    }
                    failures.push(CandidateFailure {
                        provider_id: provider.to_string(),
                        attempts: used,
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            return Err(RouterError::NoProviderAvailable {
                task: task.to_string(),
                reason: "every candidate is cooling down".into(),
            });
        }
        Err(RouterError::AllProvidersFailed {
            task: task.to_string(),
            failures,
        })
    }

    /// Up to `max_attempts` calls against one provider.
    async fn attempt<O: Operation>(
        &self,
        slot: &ProviderSlot,
        op: &O,
        options: &GenerateOptions,
        max_attempts: u32,
        total_attempts: &AtomicU32,
    ) -> Result<(O::Output, u32, Duration), (ProviderError, u32)> {
        let config = &slot.config;
        let provider = config.id.as_str();
        let mut attempt = 0;

        loop {
            attempt += 1;
            total_attempts.fetch_add(1, Ordering::Relaxed);
            debug!(provider, attempt, max_attempts, "Dispatching attempt");

            let started = Instant::now();
            let result = match tokio::time::timeout(config.timeout, op.invoke(slot.adapter.as_ref(), options)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(format!(
                    "no response within {}s",
                    config.timeout.as_secs_f64()
                ))),
            };
            let result = result.and_then(|output| op.validate(config, &output).map(|()| output));

            match result {
                Ok(output) => return Ok((output, attempt, started.elapsed())),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = config.retry_delay.saturating_mul(attempt);
                    warn!(provider, attempt, error = %e, ?delay, "Attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(provider, attempts = attempt, error = %e, "Retries exhausted");
                    } else {
                        error!(provider, error = %e, "Non-retryable provider error");
                    }
                    return Err((e, attempt));
                }
            }
        }
    }

    fn finish_usage<O: Operation>(
        &self,
        op: &O,
        slot: &ProviderSlot,
        task: &str,
        attempts: u32,
        latency: Duration,
        output: &mut O::Output,
    ) {
        {
            let usage: &mut UsageMetadata = O::usage_mut(output);
            usage.provider_id = slot.config.id.clone();
            usage.provider_name = slot.adapter.display_name().to_string();
            if usage.model.is_empty() {
                usage.model = slot.config.model.clone();
            }
            usage.task = task.to_string();
            usage.attempts = attempts;
            if usage.latency.is_zero() {
                usage.latency = latency;
            }
        }
        if O::usage_mut(output).total_tokens == 0 {
            op.estimate_usage(&self.tokens, output);
        }
    }

    // ── Health ──

    /// Snapshot of every provider's health, in configuration order.
    pub fn status(&self) -> Vec<ProviderStatus> {
        let now = Instant::now();
        self.slots
            .iter()
            .map(|slot| ProviderStatus::capture(&slot.config, &slot.state(), now))
            .collect()
    }

    /// Run every enabled adapter's health check concurrently.
    ///
    /// A passing probe ends an active cooldown early.
    pub async fn probe_health(&self) -> Vec<ProbeReport> {
        let mut probes = JoinSet::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.config.enabled {
                continue;
            }
            let adapter = slot.adapter.clone();
            let timeout = slot.config.timeout;
            probes.spawn(async move {
                let started = Instant::now();
                let healthy = tokio::time::timeout(timeout, adapter.health_check())
                    .await
                    .unwrap_or(false);
                (index, healthy, started.elapsed())
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (index, healthy, latency) = match joined {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(error = %e, "Health probe task failed");
                    continue;
                }
            };
            let slot = &self.slots[index];
            if healthy {
                let mut state = slot.state();
                if state.in_cooldown(Instant::now()) {
                    info!(provider = %slot.config.id, "Health probe passed, ending cooldown early");
                }
                state.record_probe_success(Instant::now());
            } else {
                warn!(provider = %slot.config.id, "Health probe failed");
            }
            reports.push((
                index,
                ProbeReport {
                    provider_id: slot.config.id.clone(),
                    healthy,
                    latency,
                },
            ));
        }

        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

/// Append the user turn, then the reply. Failures are logged, never returned.
async fn record_history(
    store: Arc<dyn HistoryStore>,
    conversation_id: String,
    user_text: Option<String>,
    reply: String,
    usage: UsageMetadata,
) {
    if let Some(user_text) = user_text {
        if let Err(e) = store.record(&conversation_id, Role::User, &user_text, None).await {
            warn!(conversation = %conversation_id, error = %e, "Failed to record prompt");
            return;
        }
    }
    if let Err(e) = store
        .record(&conversation_id, Role::Assistant, &reply, Some(&usage))
        .await
    {
        warn!(conversation = %conversation_id, error = %e, "Failed to record reply");
    }
}

impl std::fmt::Debug for LlmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmManager")
            .field("providers", &self.slots.iter().map(|s| &s.config.id).collect::<Vec<_>>())
            .field("routing", &self.routing)
            .field("balancing", &self.balancer.strategy())
            .field("auto_fallback", &self.auto_fallback)
            .field("history", &self.history.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use modelmux_core::config::{CooldownGrowth, ModelRule, RouteTargets, RuleCondition};
    use modelmux_core::error::StorageError;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::health::HealthState;

    // ── Fakes ──

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Ok,
        Fail(ProviderErrorKind),
        /// Succeed after sleeping.
        Delay(Duration),
        /// Never answer.
        Hang,
    }

    struct FakeAdapter {
        id: String,
        steps: Mutex<VecDeque<Step>>,
        otherwise: Step,
        calls: AtomicU32,
        dims: usize,
        report_usage: bool,
        healthy: bool,
    }

    impl FakeAdapter {
        fn new(id: &str, otherwise: Step) -> Self {
            Self {
                id: id.to_string(),
                steps: Mutex::new(VecDeque::new()),
                otherwise,
                calls: AtomicU32::new(0),
                dims: 3,
                report_usage: true,
                healthy: true,
            }
        }

        fn ok(id: &str) -> Arc<Self> {
            Arc::new(Self::new(id, Step::Ok))
        }

        fn failing(id: &str, kind: ProviderErrorKind) -> Arc<Self> {
            Arc::new(Self::new(id, Step::Fail(kind)))
        }

        fn scripted(id: &str, steps: &[Step], otherwise: Step) -> Arc<Self> {
            let adapter = Self::new(id, otherwise);
            adapter.steps.lock().unwrap().extend(steps.iter().copied());
            Arc::new(adapter)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        async fn step(&self) -> Result<(), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(self.otherwise);
            match step {
                Step::Ok => Ok(()),
                Step::Fail(kind) => Err(ProviderError::new(kind, format!("{} scripted failure", self.id))),
                Step::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                Step::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        fn usage(&self) -> UsageMetadata {
            let (prompt, completion) = if self.report_usage { (10, 5) } else { (0, 0) };
            UsageMetadata {
                model: "gpt-4o".into(),
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        fn display_name(&self) -> &str {
            &self.id
        }

        async fn generate_text(
            &self,
            _prompt: &Prompt,
            _options: &GenerateOptions,
        ) -> Result<TextGeneration, ProviderError> {
            self.step().await?;
            Ok(TextGeneration {
                text: format!("from {}", self.id),
                usage: self.usage(),
            })
        }

        async fn generate_embedding(
            &self,
            _text: &str,
            _options: &GenerateOptions,
        ) -> Result<EmbeddingGeneration, ProviderError> {
            self.step().await?;
            Ok(EmbeddingGeneration {
                vector: vec![0.5; self.dims],
                usage: self.usage(),
            })
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }
    }

    struct BrokenHistory;

    #[async_trait]
    impl HistoryStore for BrokenHistory {
        async fn record(
            &self,
            _conversation_id: &str,
            _role: Role,
            _content: &str,
            _usage: Option<&UsageMetadata>,
        ) -> Result<(), StorageError> {
            Err(StorageError::Backend("disk full".into()))
        }
    }

    type Turn = (String, Role, String, Option<UsageMetadata>);

    /// Forwards every recorded turn to a channel.
    struct ChannelHistory(mpsc::UnboundedSender<Turn>);

    #[async_trait]
    impl HistoryStore for ChannelHistory {
        async fn record(
            &self,
            conversation_id: &str,
            role: Role,
            content: &str,
            usage: Option<&UsageMetadata>,
        ) -> Result<(), StorageError> {
            let _ = self.0.send((conversation_id.to_string(), role, content.to_string(), usage.cloned()));
            Ok(())
        }
    }

    /// A store whose writes never complete.
    struct StalledHistory;

    #[async_trait]
    impl HistoryStore for StalledHistory {
        async fn record(
            &self,
            _conversation_id: &str,
            _role: Role,
            _content: &str,
            _usage: Option<&UsageMetadata>,
        ) -> Result<(), StorageError> {
            std::future::pending().await
        }
    }

    // ── Helpers ──

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            model: "gpt-4o".into(),
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
            embedding_model: Some("text-embedding-3-small".into()),
            embedding_dimensions: Some(3),
            ..Default::default()
        }
    }

    fn config(providers: Vec<ProviderConfig>, chat_route: &[&str]) -> Config {
        let mut config = Config::default();
        config.llm.default_provider = providers
            .last()
            .map(|p| p.id.clone())
            .unwrap_or_default();
        config.llm.providers = providers;
        config.usage_strategy.task_routing.insert(
            "chat".into(),
            RouteTargets::Ordered(chat_route.iter().map(|s| s.to_string()).collect()),
        );
        config
    }

    fn manager(config: &Config, adapters: &[Arc<FakeAdapter>]) -> LlmManager {
        LlmManager::with_adapters(config, |provider| {
            adapters
                .iter()
                .find(|a| a.id == provider.id)
                .map(|a| a.clone() as Arc<dyn ProviderAdapter>)
                .ok_or_else(|| ConfigurationError::Invalid(format!("no fake for {}", provider.id)))
        })
        .unwrap()
    }

    fn status_of(manager: &LlmManager, id: &str) -> ProviderStatus {
        manager.status().into_iter().find(|s| s.id == id).unwrap()
    }

    // ── Construction ──

    #[test]
    fn test_from_config_builds_http_adapters() {
        let config = config(vec![provider("a"), provider("b")], &["a", "b"]);
        let manager = LlmManager::from_config(&config).unwrap();
        assert_eq!(manager.providers().count(), 2);
        assert_eq!(manager.routing().candidates("chat"), ["a", "b"]);
    }

    #[test]
    fn test_unknown_routing_target_rejected() {
        let config = config(vec![provider("a")], &["ghost"]);
        let err = LlmManager::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            RouterError::Configuration(ConfigurationError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn test_unknown_token_counter_model_rejected() {
        let mut config = config(vec![provider("a")], &["a"]);
        config.llm.token_counter.default_model = "mystery-model".into();
        let err = LlmManager::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            RouterError::Configuration(ConfigurationError::UnknownModel { .. })
        ));
    }

    // ── Retry and fail-over ──

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_retries_then_fails_over() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::RateLimited);
        let b = FakeAdapter::ok("b");
        let manager = manager(&config(vec![provider("a"), provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let result = manager
            .generate_text("hello", "chat", &RequestOptions::new())
            .await
            .unwrap();

        assert_eq!(result.text, "from b");
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
        assert_eq!(result.usage.provider_id, "b");
        assert_eq!(result.usage.task, "chat");
        assert_eq!(result.usage.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_advances_without_retry() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::AuthFailed);
        let b = FakeAdapter::ok("b");
        let manager = manager(&config(vec![provider("a"), provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let result = manager
            .generate_text("hello", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from b");
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_retry_budget() {
        let a = FakeAdapter::scripted("a", &[Step::Fail(ProviderErrorKind::Unavailable)], Step::Ok);
        let b = FakeAdapter::ok("b");
        let manager = manager(&config(vec![provider("a"), provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let result = manager
            .generate_text("hello", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from a");
        assert_eq!(result.usage.attempts, 2);
        assert_eq!(b.calls(), 0);
        assert_eq!(status_of(&manager, "a").state, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_failed_lists_candidates_in_order() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::Unavailable);
        let b = FakeAdapter::failing("b", ProviderErrorKind::InvalidRequest);
        let manager = manager(&config(vec![provider("a"), provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let err = manager
            .generate_text("hello", "chat", &RequestOptions::new())
            .await
            .unwrap_err();

        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].provider_id, "a");
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(failures[0].error.kind, ProviderErrorKind::Unavailable);
        assert_eq!(failures[1].provider_id, "b");
        assert_eq!(failures[1].attempts, 1);
        assert_eq!(failures[1].error.kind, ProviderErrorKind::InvalidRequest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_is_retried() {
        let a = FakeAdapter::scripted("a", &[Step::Hang], Step::Ok);
        let b = FakeAdapter::ok("b");
        let mut slow = provider("a");
        slow.timeout = Duration::from_secs(2);
        let manager = manager(&config(vec![slow, provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let result = manager
            .generate_text("hello", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from a");
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_does_not_count_against_provider() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::InvalidRequest);
        let b = FakeAdapter::ok("b");
        let manager = manager(&config(vec![provider("a"), provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        manager
            .generate_text("hello", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(status_of(&manager, "a").consecutive_errors, 0);
    }

    // ── Cooldown ──

    fn cooldown_config() -> Config {
        let mut config = config(vec![provider("a"), provider("b")], &["a", "b"]);
        config.usage_strategy.failover.error_threshold = 1;
        config.usage_strategy.failover.base_cooldown = Duration::from_secs(30);
        config.usage_strategy.failover.growth = CooldownGrowth::Exponential;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_excludes_then_single_trial() {
        let unavailable = Step::Fail(ProviderErrorKind::Unavailable);
        let a = FakeAdapter::scripted("a", &[unavailable; 4], Step::Ok);
        let b = FakeAdapter::ok("b");
        let manager = manager(&cooldown_config(), &[a.clone(), b.clone()]);
        let opts = RequestOptions::new();

        // Three failed attempts put a into a 30s cooldown.
        assert_eq!(manager.generate_text("q", "chat", &opts).await.unwrap().text, "from b");
        assert_eq!(a.calls(), 3);
        assert_eq!(status_of(&manager, "a").state, HealthState::Cooldown);

        // Inside the window a is not selected.
        assert_eq!(manager.generate_text("q", "chat", &opts).await.unwrap().text, "from b");
        assert_eq!(a.calls(), 3);

        // After the window: one trial attempt, which fails and doubles the cooldown.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.generate_text("q", "chat", &opts).await.unwrap().text, "from b");
        assert_eq!(a.calls(), 4);
        let status = status_of(&manager, "a");
        assert_eq!(status.state, HealthState::Cooldown);
        assert_eq!(status.cooldown_remaining, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(30)).await;
        manager.generate_text("q", "chat", &opts).await.unwrap();
        assert_eq!(a.calls(), 4);

        // The next trial succeeds and a is healthy again.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.generate_text("q", "chat", &opts).await.unwrap().text, "from a");
        assert_eq!(a.calls(), 5);
        assert_eq!(status_of(&manager, "a").state, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_trial() {
        let unavailable = Step::Fail(ProviderErrorKind::Unavailable);
        let a = FakeAdapter::scripted(
            "a",
            &[unavailable, unavailable, unavailable, Step::Delay(Duration::from_secs(1))],
            Step::Ok,
        );
        let b = FakeAdapter::ok("b");
        let manager = manager(&cooldown_config(), &[a.clone(), b.clone()]);
        let opts = RequestOptions::new();

        manager.generate_text("q", "chat", &opts).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let (first, second) = tokio::join!(
            manager.generate_text("q", "chat", &opts),
            manager.generate_text("q", "chat", &opts),
        );
        let mut texts = vec![first.unwrap().text, second.unwrap().text];
        texts.sort();
        assert_eq!(texts, ["from a", "from b"]);
        assert_eq!(a.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_candidate_cooling_down_is_no_provider() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::Timeout);
        let mut config = config(vec![provider("a")], &["a"]);
        config.usage_strategy.failover.error_threshold = 1;
        let manager = manager(&config, &[a.clone()]);

        let err = manager
            .generate_text("q", "chat", &RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::AllProvidersFailed { .. }));

        let err = manager
            .generate_text("q", "chat", &RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NoProviderAvailable { .. }));
        assert_eq!(a.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_fallback_off_tries_first_only_and_never_cools_down() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::Unavailable);
        let b = FakeAdapter::ok("b");
        let mut config = cooldown_config();
        config.usage_strategy.auto_fallback = false;
        let manager = manager(&config, &[a.clone(), b.clone()]);

        for _ in 0..3 {
            let err = manager
                .generate_text("q", "chat", &RequestOptions::new())
                .await
                .unwrap_err();
            assert_eq!(err.failures().len(), 1);
        }
        assert_eq!(a.calls(), 9);
        assert_eq!(b.calls(), 0);
        let status = status_of(&manager, "a");
        assert_eq!(status.state, HealthState::Degraded);
        assert_eq!(status.consecutive_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_disabled_candidates_make_no_calls() {
        let a = FakeAdapter::ok("a");
        let b = FakeAdapter::ok("b");
        let mut pa = provider("a");
        pa.enabled = false;
        let mut pb = provider("b");
        pb.enabled = false;
        let manager = manager(&config(vec![pa, pb], &["a"]), &[a.clone(), b.clone()]);

        let err = manager
            .generate_text("q", "chat", &RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NoProviderAvailable { .. }));
        assert_eq!(a.calls() + b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_health_ends_cooldown() {
        let a = FakeAdapter::scripted("a", &[Step::Fail(ProviderErrorKind::Unavailable); 3], Step::Ok);
        let b = FakeAdapter::ok("b");
        let manager = manager(&cooldown_config(), &[a.clone(), b.clone()]);

        manager
            .generate_text("q", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(status_of(&manager, "a").state, HealthState::Cooldown);

        let reports = manager.probe_health().await;
        assert_eq!(reports.iter().map(|r| r.provider_id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(reports.iter().all(|r| r.healthy));
        assert_ne!(status_of(&manager, "a").state, HealthState::Cooldown);

        let result = manager
            .generate_text("q", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from a");
    }

    // ── Deadline and cancellation ──

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_whole_sequence() {
        let a = FakeAdapter::new("a", Step::Hang);
        let a = Arc::new(a);
        let b = FakeAdapter::ok("b");
        let manager = manager(&config(vec![provider("a"), provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let opts = RequestOptions::new().deadline(Duration::from_secs(5));
        let err = manager.generate_text("q", "chat", &opts).await.unwrap_err();
        assert!(matches!(err, RouterError::DeadlineExceeded { attempts: 1, .. }));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_request() {
        let a = Arc::new(FakeAdapter::new("a", Step::Hang));
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a.clone()]);

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let opts = RequestOptions::new().cancel_token(token);
        let err = manager.generate_text("q", "chat", &opts).await.unwrap_err();
        assert!(matches!(err, RouterError::Cancelled { .. }));
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_makes_no_calls() {
        let a = FakeAdapter::ok("a");
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a.clone()]);
        let token = CancellationToken::new();
        token.cancel();

        let opts = RequestOptions::new().cancel_token(token);
        assert!(manager.generate_text("q", "chat", &opts).await.is_err());
        assert_eq!(a.calls(), 0);
    }

    // ── Embeddings ──

    #[tokio::test(start_paused = true)]
    async fn test_embedding_dimension_mismatch_fails_over() {
        let mut wrong = FakeAdapter::new("a", Step::Ok);
        wrong.dims = 4;
        let a = Arc::new(wrong);
        let b = FakeAdapter::ok("b");
        let mut config = config(vec![provider("a"), provider("b")], &["a", "b"]);
        config
            .usage_strategy
            .task_routing
            .insert("embeddings".into(), RouteTargets::Ordered(vec!["a".into(), "b".into()]));
        let manager = manager(&config, &[a.clone(), b.clone()]);

        let result = manager
            .generate_embedding("text", "embeddings", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.vector.len(), 3);
        assert_eq!(result.usage.provider_id, "b");
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedding_without_model_is_skipped() {
        let a = FakeAdapter::ok("a");
        let b = FakeAdapter::ok("b");
        let mut pa = provider("a");
        pa.embedding_model = None;
        let manager = manager(&config(vec![pa, provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let result = manager
            .generate_embedding("text", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.usage.provider_id, "b");
        assert_eq!(a.calls(), 0);
    }

    // ── Usage, budget and history ──

    #[tokio::test(start_paused = true)]
    async fn test_usage_backfilled_when_vendor_omits_it() {
        let mut quiet = FakeAdapter::new("a", Step::Ok);
        quiet.report_usage = false;
        let a = Arc::new(quiet);
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a]);

        let result = manager
            .generate_text("how many tokens is this", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert!(result.usage.estimated);
        assert!(result.usage.prompt_tokens > 0);
        assert_eq!(
            result.usage.total_tokens,
            result.usage.prompt_tokens + result.usage.completion_tokens
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_usage_kept() {
        let a = FakeAdapter::ok("a");
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a]);
        let result = manager
            .generate_text("hi", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert!(!result.usage.estimated);
        assert_eq!(result.usage.total_tokens, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_guard_skips_small_context_provider() {
        let a = FakeAdapter::ok("a");
        let b = FakeAdapter::ok("b");
        let mut small = provider("a");
        small.context_window = Some(16);
        let manager = manager(&config(vec![small, provider("b")], &["a", "b"]), &[a.clone(), b.clone()]);

        let prompt = "a long prompt ".repeat(20);
        let result = manager
            .generate_text(prompt, "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from b");
        assert_eq!(a.calls(), 0);
        assert_eq!(status_of(&manager, "a").consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_records_both_turns() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = FakeAdapter::ok("a");
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a]).with_history(Arc::new(ChannelHistory(tx)));

        let opts = RequestOptions::new().conversation("conv-1");
        manager.generate_text("hello there", "chat", &opts).await.unwrap();

        let (conversation, role, content, usage) = rx.recv().await.unwrap();
        assert_eq!(conversation, "conv-1");
        assert_eq!(role, Role::User);
        assert_eq!(content, "hello there");
        assert!(usage.is_none());

        let (_, role, content, usage) = rx.recv().await.unwrap();
        assert_eq!(role, Role::Assistant);
        assert_eq!(content, "from a");
        assert_eq!(usage.unwrap().provider_id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_history_without_conversation_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = FakeAdapter::ok("a");
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a]).with_history(Arc::new(ChannelHistory(tx)));

        manager.generate_text("hi", "chat", &RequestOptions::new()).await.unwrap();
        drop(manager);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_history_store_does_not_block_reply() {
        let a = FakeAdapter::ok("a");
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a.clone()]).with_history(Arc::new(StalledHistory));

        let opts = RequestOptions::new()
            .conversation("conv-1")
            .deadline(Duration::from_millis(200));
        let result = tokio::time::timeout(Duration::from_secs(2), manager.generate_text("hi", "chat", &opts))
            .await
            .expect("reply must not wait on the history store");
        assert_eq!(result.unwrap().text, "from a");
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_failure_does_not_fail_request() {
        let a = FakeAdapter::ok("a");
        let manager = manager(&config(vec![provider("a")], &["a"]), &[a]).with_history(Arc::new(BrokenHistory));

        let opts = RequestOptions::new().conversation("conv-1");
        let result = manager.generate_text("hi", "chat", &opts).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_task_uses_default_provider() {
        let a = FakeAdapter::ok("a");
        let b = FakeAdapter::ok("b");
        let manager = manager(&config(vec![provider("a"), provider("b")], &["a"]), &[a.clone(), b.clone()]);

        let result = manager
            .generate_text("hi", "creative", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.text, "from b");
        assert_eq!(a.calls(), 0);
    }

    // ── Balancing and model rules ──

    async fn answered_by(manager: &LlmManager, options: &RequestOptions) -> String {
        manager.generate_text("hi", "chat", options).await.unwrap().usage.provider_id
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_spreads_over_pool() {
        let adapters = [FakeAdapter::ok("a"), FakeAdapter::ok("b"), FakeAdapter::ok("c")];
        let mut config = config(vec![provider("a"), provider("b"), provider("c")], &["a", "b", "c"]);
        config.usage_strategy.balancing = BalanceStrategy::RoundRobin;
        let manager = manager(&config, &adapters);

        let opts = RequestOptions::new();
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(answered_by(&manager, &opts).await);
        }
        assert_eq!(order, ["a", "b", "c", "a"]);
        assert_eq!(manager.balancing(), BalanceStrategy::RoundRobin);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_still_fails_over() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::AuthFailed);
        let b = FakeAdapter::ok("b");
        let mut config = config(vec![provider("a"), provider("b")], &["a", "b"]);
        config.usage_strategy.balancing = BalanceStrategy::RoundRobin;
        let manager = manager(&config, &[a.clone(), b.clone()]);

        let opts = RequestOptions::new();
        assert_eq!(answered_by(&manager, &opts).await, "b");
        assert_eq!(answered_by(&manager, &opts).await, "b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_used_prefers_idle_provider() {
        let adapters = [FakeAdapter::ok("a"), FakeAdapter::ok("b")];
        let mut config = config(vec![provider("a"), provider("b")], &["a", "b"]);
        config.usage_strategy.balancing = BalanceStrategy::LeastUsed;
        let manager = manager(&config, &adapters);

        let opts = RequestOptions::new();
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(answered_by(&manager, &opts).await);
        }
        assert_eq!(order, ["a", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balancing_without_fallback_uses_balanced_first() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::Unavailable);
        let b = FakeAdapter::ok("b");
        let mut config = config(vec![provider("a"), provider("b")], &["a", "b"]);
        config.usage_strategy.balancing = BalanceStrategy::RoundRobin;
        config.usage_strategy.auto_fallback = false;
        let manager = manager(&config, &[a.clone(), b.clone()]);

        let opts = RequestOptions::new();
        let first = manager.generate_text("hi", "chat", &opts).await;
        assert!(matches!(first, Err(RouterError::AllProvidersFailed { .. })));
        assert_eq!(answered_by(&manager, &opts).await, "b");
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_rule_adds_candidate_for_large_requests() {
        let a = FakeAdapter::failing("a", ProviderErrorKind::AuthFailed);
        let big = FakeAdapter::ok("big");
        let fallback = FakeAdapter::ok("fallback");
        let mut config = config(vec![provider("a"), provider("big"), provider("fallback")], &["a"]);
        config.usage_strategy.model_rules.push(ModelRule {
            provider: "big".into(),
            condition: RuleCondition {
                min_tokens: Some(4000),
                ..Default::default()
            },
        });
        let manager = manager(&config, &[a.clone(), big.clone(), fallback.clone()]);

        let large = RequestOptions::new().max_tokens(8000);
        assert_eq!(answered_by(&manager, &large).await, "big");

        let small = RequestOptions::new().max_tokens(100);
        assert_eq!(answered_by(&manager, &small).await, "fallback");
        assert_eq!(big.calls(), 1);
    }

    // ── Integration tests with mock server ──

    fn http_provider(id: &str, endpoint: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            model: "gpt-4o".into(),
            endpoint: endpoint.into(),
            credentials: "test-key".into(),
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_http_rate_limit_fails_over_to_second_vendor() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let limited = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "Rate limit reached", "code": "rate_limit_exceeded"}
            })))
            .expect(2)
            .mount(&limited)
            .await;

        let backup = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o",
                "choices": [{"message": {"content": "pong"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&backup)
            .await;

        let config = config(
            vec![http_provider("a", &limited.uri()), http_provider("b", &backup.uri())],
            &["a", "b"],
        );
        let manager = LlmManager::from_config(&config).unwrap();

        let result = manager
            .generate_text("ping", "chat", &RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(result.text, "pong");
        assert_eq!(result.usage.provider_id, "b");
        assert!(result.usage.estimated);
        assert!(result.usage.total_tokens > 0);

        let a = status_of(&manager, "a");
        assert_eq!(a.consecutive_errors, 1);
        assert!(a.last_error.unwrap().starts_with("rate_limited"));
    }

    #[tokio::test]
    async fn test_http_auth_failure_reported_per_candidate() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = config(vec![http_provider("a", &server.uri())], &["a"]);
        let manager = LlmManager::from_config(&config).unwrap();

        let err = manager
            .generate_text("ping", "chat", &RequestOptions::new())
            .await
            .unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 1);
        assert_eq!(failures[0].error.kind, ProviderErrorKind::AuthFailed);
    }
}
