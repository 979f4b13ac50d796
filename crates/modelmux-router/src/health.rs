//! Per-provider health state machine.
//!
//! ```text
//! Healthy ──failure (< threshold)──▶ Degraded ──failure (≥ threshold)──▶ Cooldown(until)
//!    ▲                                  │                                   │
//!    └────────────── success ───────────┘            until elapsed: one trial call
//!                                                     success ▶ Healthy
//!                                                     failure ▶ Cooldown (longer)
//! ```
//!
//! Providers are never removed at runtime. All transitions take an explicit
//! `now` so the router can drive them from `tokio::time`.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use modelmux_core::config::{FailoverPolicy, ProviderConfig, ProviderKind};
use modelmux_core::error::ProviderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Recent failures, still below the threshold (or awaiting a trial).
    Degraded,
    Cooldown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Cooldown => "cooldown",
        })
    }
}

/// Outcome of asking whether a provider may take a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Normal call with the full retry budget.
    Normal,
    /// First call after cooldown: a single attempt, no retries.
    Trial,
    /// Cooling down, or another caller holds the trial.
    Rejected,
}

/// Mutable runtime state for one provider. Owned by the router.
#[derive(Clone, Debug, Default)]
pub struct ProviderRuntimeState {
    pub consecutive_errors: u32,
    /// Set on entering cooldown; cleared by the next success.
    pub disabled_until: Option<Instant>,
    pub last_latency: Option<Duration>,
    trial_in_flight: bool,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<ProviderError>,
}

impl ProviderRuntimeState {
    pub fn state(&self, now: Instant) -> HealthState {
        match self.disabled_until {
            Some(until) if until > now => HealthState::Cooldown,
            Some(_) => HealthState::Degraded,
            None if self.consecutive_errors > 0 => HealthState::Degraded,
            None => HealthState::Healthy,
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.state(now) == HealthState::Cooldown
    }

    /// Time left in cooldown, if any.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.disabled_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Decide whether a call may go to this provider, claiming the trial slot
    /// when the cooldown has just elapsed.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.disabled_until {
            Some(until) if until > now => Admission::Rejected,
            Some(_) if self.trial_in_flight => Admission::Rejected,
            Some(_) => {
                self.trial_in_flight = true;
                Admission::Trial
            }
            None => Admission::Normal,
        }
    }

    /// Give the trial slot back without a verdict (call abandoned or the
    /// failure was the request's fault).
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.consecutive_errors = 0;
        self.disabled_until = None;
        self.trial_in_flight = false;
        self.last_latency = Some(latency);
        self.total_calls += 1;
    }

    /// Count a failed candidate. With `policy` set (auto fallback), crossing
    /// the threshold starts a cooldown, whose length is returned.
    pub fn record_failure(
        &mut self,
        now: Instant,
        policy: Option<&FailoverPolicy>,
        error: &ProviderError,
    ) -> Option<Duration> {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.trial_in_flight = false;
        self.total_calls += 1;
        self.total_failures += 1;
        self.last_error = Some(error.clone());

        let cooldown = policy.and_then(|p| p.cooldown_for(self.consecutive_errors))?;
        self.disabled_until = Some(now + cooldown);
        Some(cooldown)
    }

    /// A passing health probe ends an active cooldown early; the next call is
    /// still a trial.
    pub fn record_probe_success(&mut self, now: Instant) {
        if self.in_cooldown(now) {
            self.disabled_until = Some(now);
        }
    }
}

// ─────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────

/// Point-in-time view of one provider, for status output.
#[derive(Clone, Debug)]
pub struct ProviderStatus {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    pub enabled: bool,
    pub state: HealthState,
    pub consecutive_errors: u32,
    pub cooldown_remaining: Option<Duration>,
    pub last_latency: Option<Duration>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl ProviderStatus {
    pub(crate) fn capture(config: &ProviderConfig, state: &ProviderRuntimeState, now: Instant) -> Self {
        Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
            kind: config.kind,
            model: config.model.clone(),
            enabled: config.enabled,
            state: state.state(now),
            consecutive_errors: state.consecutive_errors,
            cooldown_remaining: state.cooldown_remaining(now),
            last_latency: state.last_latency,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            last_error: state.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Result of one health probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub provider_id: String,
    pub healthy: bool,
    pub latency: Duration,
}
