//! Per-backend circuit breaker and rate-limit tracker.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, skipped without a network call
//! - Half-Open: open window elapsed, a bounded number of trials admitted
//!
//! # State Transitions
//! ```text
//! Closed ──[failure_threshold consecutive failures]──► Open
//!                                                       │
//!                                              [open_timeout elapsed]
//!                                                       │
//!                                                       ▼
//!                                                   Half-Open
//!                                                       │
//!                        ┌──────────────────────────────┴─────────────┐
//!                   [trial succeeds]                  [last budgeted trial fails]
//!                        │                                            │
//!                        ▼                                            ▼
//!                     Closed                            Open (fresh window from now)
//! ```
//!
//! A 429 never moves the state machine. It demotes the backend to the back of
//! the candidate list for `cooldown_seconds` instead.
//!
//! # Concurrency
//! All backend states live in one `RwLock<Vec<_>>`. Every operation holds the
//! lock only for its own read or write, never across I/O.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{BackendConfig, FailoverConfig};
use crate::observability::metrics;

/// Thresholds the breaker runs with.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_requests: u32,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&FailoverConfig::default())
    }
}

impl From<&FailoverConfig> for BreakerSettings {
    fn from(config: &FailoverConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker.failure_threshold.max(1),
            open_timeout: Duration::from_secs(config.circuit_breaker.open_timeout_seconds),
            half_open_requests: config.circuit_breaker.half_open_requests.max(1),
            cooldown: Duration::from_secs(config.rate_limit.cooldown_seconds),
        }
    }
}

/// Index of a backend in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(usize);

impl BackendId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Why a backend was hard-skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    CircuitOpen { remaining: Duration },
    HalfOpenExhausted { budget: u32 },
}

impl SkipReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::CircuitOpen { .. } => "circuit_open",
            SkipReason::HalfOpenExhausted { .. } => "half_open_exhausted",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("backend disabled"),
            SkipReason::CircuitOpen { remaining } => {
                // Round up so "0s remaining" never shows while still open.
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                write!(f, "circuit open ({secs}s remaining)")
            }
            SkipReason::HalfOpenExhausted { budget } => {
                write!(f, "circuit half-open, all {budget} trial slot(s) taken")
            }
        }
    }
}

/// A backend in the order it should be tried.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: BackendId,
    pub backend: Arc<BackendConfig>,
    pub rate_limited: bool,
}

/// Result of asking the breaker whether an attempt may go ahead.
#[derive(Debug)]
pub enum Admission {
    Allow,
    /// A half-open trial slot was reserved for this attempt.
    Probe(TrialPermit),
    Skip(SkipReason),
}

/// Reservation of a half-open trial slot.
///
/// Recording a success or failure settles the trial. A permit dropped
/// unsettled (client went away, 401, 429, ...) hands the slot back.
#[derive(Debug)]
#[must_use]
pub struct TrialPermit {
    breaker: Arc<CircuitBreaker>,
    id: BackendId,
    pub trial: u32,
    pub budget: u32,
    armed: bool,
}

impl TrialPermit {
    /// Mark the trial as settled by a recorded outcome.
    pub fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialPermit {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial(self.id);
        }
    }
}

#[derive(Debug)]
struct BackendState {
    config: Arc<BackendConfig>,
    enabled: bool,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    circuit_open: bool,
    opened_at: Option<Instant>,
    half_open_tries: u32,
    last_rate_limited: Option<Instant>,
    retry_after_until: Option<Instant>,
}

impl BackendState {
    fn new(config: BackendConfig) -> Self {
        Self {
            enabled: config.enabled,
            config: Arc::new(config),
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            last_error: None,
            circuit_open: false,
            opened_at: None,
            half_open_tries: 0,
            last_rate_limited: None,
            retry_after_until: None,
        }
    }

    fn circuit_state(&self, settings: &BreakerSettings, now: Instant) -> CircuitState {
        if !self.circuit_open {
            return CircuitState::Closed;
        }
        match self.opened_at {
            Some(opened) if now.saturating_duration_since(opened) < settings.open_timeout => {
                CircuitState::Open
            }
            _ => CircuitState::HalfOpen,
        }
    }

    fn remaining_open(&self, settings: &BreakerSettings, now: Instant) -> Duration {
        self.opened_at
            .map(|opened| settings.open_timeout.saturating_sub(now.saturating_duration_since(opened)))
            .unwrap_or_default()
    }

    fn is_rate_limited(&self, settings: &BreakerSettings, now: Instant) -> bool {
        self.last_rate_limited
            .is_some_and(|at| now.saturating_duration_since(at) < settings.cooldown)
    }

    fn skip_reason(&self, settings: &BreakerSettings, now: Instant) -> Option<SkipReason> {
        if !self.enabled {
            return Some(SkipReason::Disabled);
        }
        match self.circuit_state(settings, now) {
            CircuitState::Closed => None,
            CircuitState::Open => Some(SkipReason::CircuitOpen {
                remaining: self.remaining_open(settings, now),
            }),
            CircuitState::HalfOpen if self.half_open_tries >= settings.half_open_requests => {
                Some(SkipReason::HalfOpenExhausted {
                    budget: settings.half_open_requests,
                })
            }
            CircuitState::HalfOpen => None,
        }
    }

    fn reset_circuit(&mut self) {
        self.consecutive_failures = 0;
        self.circuit_open = false;
        self.opened_at = None;
        self.half_open_tries = 0;
    }
}

/// Shared failover state for every configured backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    states: RwLock<Vec<BackendState>>,
}

impl CircuitBreaker {
    pub fn new(backends: Vec<BackendConfig>, settings: BreakerSettings) -> Self {
        Self {
            settings,
            states: RwLock::new(backends.into_iter().map(BackendState::new).collect()),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<BackendState>> {
        self.states.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<BackendState>> {
        self.states.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enabled backends, non-rate-limited first, config order within each group.
    pub fn sort_by_priority(&self) -> Vec<Candidate> {
        self.sort_by_priority_at(Instant::now())
    }

    pub fn sort_by_priority_at(&self, now: Instant) -> Vec<Candidate> {
        let states = self.read();
        let (normal, limited): (Vec<Candidate>, Vec<Candidate>) = states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.enabled)
            .map(|(i, s)| Candidate {
                id: BackendId(i),
                backend: s.config.clone(),
                rate_limited: s.is_rate_limited(&self.settings, now),
            })
            .partition(|c| !c.rate_limited);

        normal.into_iter().chain(limited).collect()
    }

    /// Read-only skip check. Does not reserve a half-open trial.
    pub fn should_skip(&self, id: BackendId) -> Option<SkipReason> {
        self.should_skip_at(id, Instant::now())
    }

    pub fn should_skip_at(&self, id: BackendId, now: Instant) -> Option<SkipReason> {
        let states = self.read();
        match states.get(id.0) {
            Some(state) => state.skip_reason(&self.settings, now),
            None => Some(SkipReason::Disabled),
        }
    }

    /// Skip check and half-open trial reservation under one write lock.
    pub fn admit(self: &Arc<Self>, id: BackendId) -> Admission {
        self.admit_at(id, Instant::now())
    }

    pub fn admit_at(self: &Arc<Self>, id: BackendId, now: Instant) -> Admission {
        let mut states = self.write();
        let Some(state) = states.get_mut(id.0) else {
            return Admission::Skip(SkipReason::Disabled);
        };

        if let Some(reason) = state.skip_reason(&self.settings, now) {
            return Admission::Skip(reason);
        }
        if state.circuit_state(&self.settings, now) != CircuitState::HalfOpen {
            return Admission::Allow;
        }

        state.half_open_tries += 1;
        tracing::info!(
            backend = %state.config.name,
            trial = state.half_open_tries,
            budget = self.settings.half_open_requests,
            "Circuit half-open, admitting trial request"
        );
        Admission::Probe(TrialPermit {
            breaker: Arc::clone(self),
            id,
            trial: state.half_open_tries,
            budget: self.settings.half_open_requests,
            armed: true,
        })
    }

    pub fn is_half_open(&self, id: BackendId) -> bool {
        self.is_half_open_at(id, Instant::now())
    }

    pub fn is_half_open_at(&self, id: BackendId, now: Instant) -> bool {
        self.read()
            .get(id.0)
            .is_some_and(|s| s.circuit_state(&self.settings, now) == CircuitState::HalfOpen)
    }

    /// Any success closes the circuit and clears the failure streak.
    pub fn record_success(&self, id: BackendId) {
        let mut states = self.write();
        let Some(state) = states.get_mut(id.0) else {
            return;
        };
        let was_open = state.circuit_open;
        state.reset_circuit();
        state.last_error = None;

        if was_open {
            tracing::info!(backend = %state.config.name, "Circuit closed after successful trial");
            metrics::record_circuit_transition(&state.config.name, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self, id: BackendId, error: impl Into<String>) {
        self.record_failure_at(id, error, Instant::now());
    }

    pub fn record_failure_at(&self, id: BackendId, error: impl Into<String>, now: Instant) {
        let mut states = self.write();
        let Some(state) = states.get_mut(id.0) else {
            return;
        };
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(now);
        state.last_failure_at = Some(Utc::now());
        state.last_error = Some(error.into());

        if state.circuit_open {
            let half_open = state.circuit_state(&self.settings, now) == CircuitState::HalfOpen;
            if half_open && state.half_open_tries >= self.settings.half_open_requests {
                state.opened_at = Some(now);
                state.half_open_tries = 0;
                tracing::warn!(
                    backend = %state.config.name,
                    open_timeout = ?self.settings.open_timeout,
                    "Half-open trial failed, circuit re-opened"
                );
                metrics::record_circuit_transition(&state.config.name, CircuitState::Open);
            }
            return;
        }

        if state.consecutive_failures >= self.settings.failure_threshold {
            state.circuit_open = true;
            state.opened_at = Some(now);
            state.half_open_tries = 0;
            tracing::warn!(
                backend = %state.config.name,
                failures = state.consecutive_failures,
                open_timeout = ?self.settings.open_timeout,
                "Circuit opened"
            );
            metrics::record_circuit_transition(&state.config.name, CircuitState::Open);
        }
    }

    /// Note a 429. Never touches the failure count.
    pub fn record_rate_limit(&self, id: BackendId, retry_after: Option<Duration>) {
        self.record_rate_limit_at(id, retry_after, Instant::now());
    }

    pub fn record_rate_limit_at(&self, id: BackendId, retry_after: Option<Duration>, now: Instant) {
        let mut states = self.write();
        let Some(state) = states.get_mut(id.0) else {
            return;
        };
        state.last_rate_limited = Some(now);
        state.retry_after_until = retry_after.map(|d| now + d);
        tracing::info!(
            backend = %state.config.name,
            retry_after = ?retry_after,
            cooldown = ?self.settings.cooldown,
            "Backend rate limited, demoted"
        );
    }

    /// Return a reserved half-open trial slot without a verdict.
    fn release_trial(&self, id: BackendId) {
        if let Some(state) = self.write().get_mut(id.0) {
            state.half_open_tries = state.half_open_tries.saturating_sub(1);
        }
    }

    /// Runtime enable/disable. Enabling starts from a closed circuit.
    /// Returns false when no backend has that name.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut states = self.write();
        let Some(state) = states.iter_mut().find(|s| s.config.name == name) else {
            return false;
        };
        state.enabled = enabled;
        if enabled {
            state.reset_circuit();
            state.last_error = None;
        }
        true
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> Vec<BackendStatus> {
        let wall_now = Utc::now();
        let to_wall = |at: Instant| -> Option<DateTime<Utc>> {
            chrono::Duration::from_std(at.saturating_duration_since(now))
                .ok()
                .map(|d| wall_now + d)
        };

        self.read()
            .iter()
            .map(|s| {
                let state = s.circuit_state(&self.settings, now);
                let rate_limited = s.is_rate_limited(&self.settings, now);
                let cooldown_until = s
                    .last_rate_limited
                    .map(|at| at + self.settings.cooldown)
                    .filter(|_| rate_limited);

                BackendStatus {
                    name: s.config.name.clone(),
                    enabled: s.enabled,
                    circuit_breaker: CircuitStatus {
                        state,
                        consecutive_failures: s.consecutive_failures,
                        last_failure_time: s.last_failure_at,
                        half_open_tries: s.half_open_tries,
                        open_remaining_seconds: (state == CircuitState::Open)
                            .then(|| s.remaining_open(&self.settings, now).as_secs()),
                    },
                    rate_limit: RateLimitStatus {
                        rate_limited,
                        cooldown_until: cooldown_until.and_then(to_wall),
                        cooldown_remaining_seconds: cooldown_until
                            .map(|until| until.saturating_duration_since(now).as_secs()),
                        retry_after_seconds: s
                            .retry_after_until
                            .map(|until| until.saturating_duration_since(now).as_secs())
                            .filter(|secs| *secs > 0),
                    },
                    last_error: s.last_error.clone(),
                }
            })
            .collect()
    }

    pub fn status_of(&self, name: &str) -> Option<BackendStatus> {
        self.status().into_iter().find(|s| s.name == name)
    }
}

/// Snapshot of one backend's failover state.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub enabled: bool,
    pub circuit_breaker: CircuitStatus,
    pub rate_limit: RateLimitStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub half_open_tries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_remaining_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub rate_limited: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cooldown_remaining_seconds: Option<u64>,
    pub retry_after_seconds: Option<u64>,
}
