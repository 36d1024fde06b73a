//! Per-destination circuit breakers.
//!
//! A breaker suspends delivery to a destination after repeated failures and
//! probes recovery with a bounded number of calls before fully resuming.
//! Healthy destinations are never affected by a misbehaving one.
//!
//! # State Machine
//!
//! ```text
//!                          ┌─────────────────────────┐
//!                          │        CLOSED           │
//!                          │   (Normal Operation)    │
//!                          │                         │
//!                          │ ● All attempts allowed  │
//!                          │ ● Counting failures     │
//!                          └─────────────────────────┘
//!                           │                        ▲
//!       failure_threshold   │                        │ half_open_max_calls
//!       consecutive failures│                        │ consecutive successes
//!                           ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │ recovery_timeout │       HALF-OPEN       │
//!    │      (Fail Fast)        │  since the last  │   (Probing Recovery)  │
//!    │                         │ ───────────────▶ │                       │
//!    │ ● No HTTP calls made    │     failure      │ ● Bounded probe calls │
//!    └─────────────────────────┘                  └───────────────────────┘
//!                ▲                                            │
//!                └────────────── any failure ─────────────────┘
//! ```
//!
//! Recovery is evaluated lazily from stored timestamps on every query. No
//! background timer exists, so an injected [`Clock`] fully determines
//! behaviour.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{Clock, DestinationId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Circuit breaker thresholds shared by all destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before an open circuit admits probes.
    pub recovery_timeout: Duration,
    /// Probe calls admitted while half-open, and successes needed to close.
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

/// Mode of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Destination suspended; attempts fail fast.
    Open,
    /// Probing recovery with a bounded number of calls.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Snapshot of a breaker's bookkeeping.
///
/// `consecutive_failures` and `consecutive_successes` are never both
/// non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Current mode.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Probe successes since entering half-open.
    pub consecutive_successes: u32,
    /// When the most recent failure was recorded.
    pub last_failure_at: Option<Instant>,
    /// When the mode last changed.
    pub last_transition_at: Instant,
    /// Probe calls admitted since entering half-open.
    pub half_open_calls: u32,
}

impl CircuitBreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_transition_at: now,
            half_open_calls: 0,
        }
    }
}

/// Circuit breaker guarding a single destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination_id: DestinationId,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `destination_id`.
    pub fn new(destination_id: DestinationId, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Mutex::new(CircuitBreakerState::new(clock.now()));
        Self { destination_id, config, clock, inner }
    }

    /// Destination this breaker guards.
    pub fn destination_id(&self) -> &DestinationId {
        &self.destination_id
    }

    /// Whether an attempt may proceed right now.
    ///
    /// While half-open each `true` consumes one probe slot, so at most
    /// `half_open_max_calls` concurrent probes reach the destination.
    #[allow(clippy::significant_drop_tightening)] // Check and admission must be atomic
    pub fn can_execute(&self) -> bool {
        let mut state = self.inner.lock();
        self.refresh(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.half_open_calls < self.config.half_open_max_calls {
                    state.half_open_calls += 1;
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Admits an attempt or returns a circuit-open error carrying the
    /// recovery delay.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::CircuitOpen`] when the breaker is open or its
    /// half-open probe budget is exhausted.
    pub fn check(&self) -> Result<()> {
        if self.can_execute() {
            Ok(())
        } else {
            Err(DeliveryError::circuit_open(
                self.destination_id.as_str(),
                self.next_attempt_delay(),
            ))
        }
    }

    /// Records a successful call.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub fn record_success(&self) {
        let mut state = self.inner.lock();
        state.consecutive_failures = 0;

        match state.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                tracing::debug!(
                    destination_id = %self.destination_id,
                    "success recorded for open circuit"
                );
            },
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.half_open_max_calls {
                    self.transition(&mut state, CircuitState::Closed);
                }
            },
        }
    }

    /// Records a failed call.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        state.consecutive_successes = 0;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(now);

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => self.transition(&mut state, CircuitState::Open),
        }
    }

    /// How long a rejected attempt should wait before trying again.
    ///
    /// Open: time remaining until `recovery_timeout` has elapsed since the
    /// last failure. Half-open with no probe slots left: the full
    /// `recovery_timeout`. Otherwise zero.
    #[allow(clippy::significant_drop_tightening)]
    pub fn next_attempt_delay(&self) -> Duration {
        let mut state = self.inner.lock();
        self.refresh(&mut state);

        match state.state {
            CircuitState::Open => {
                let since = state.last_failure_at.unwrap_or(state.last_transition_at);
                let elapsed = self.clock.now().saturating_duration_since(since);
                self.config.recovery_timeout.saturating_sub(elapsed)
            },
            CircuitState::HalfOpen if state.half_open_calls >= self.config.half_open_max_calls => {
                self.config.recovery_timeout
            },
            _ => Duration::ZERO,
        }
    }

    /// Current bookkeeping, with lazy recovery applied.
    pub fn state(&self) -> CircuitBreakerState {
        let mut state = self.inner.lock();
        self.refresh(&mut state);
        state.clone()
    }

    /// Current mode, with lazy recovery applied.
    pub fn current_state(&self) -> CircuitState {
        self.state().state
    }

    /// Forces the breaker back to closed with cleared counters.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        *state = CircuitBreakerState::new(self.clock.now());
        drop(state);

        tracing::info!(destination_id = %self.destination_id, "circuit breaker reset");
    }

    fn refresh(&self, state: &mut CircuitBreakerState) {
        if state.state != CircuitState::Open {
            return;
        }

        let since = state.last_failure_at.unwrap_or(state.last_transition_at);
        if self.clock.now().saturating_duration_since(since) >= self.config.recovery_timeout {
            self.transition(state, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.last_transition_at = self.clock.now();
        state.half_open_calls = 0;
        state.consecutive_successes = 0;

        match to {
            CircuitState::Open => {
                tracing::warn!(
                    destination_id = %self.destination_id,
                    from = %from,
                    consecutive_failures = state.consecutive_failures,
                    "circuit breaker opened"
                );
            },
            CircuitState::HalfOpen => {
                tracing::info!(
                    destination_id = %self.destination_id,
                    "circuit breaker half-open, probing recovery"
                );
            },
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                tracing::info!(
                    destination_id = %self.destination_id,
                    "circuit breaker closed, destination recovered"
                );
            },
        }
    }
}

/// Owns one breaker per destination, created lazily on first use.
///
/// Cloned handles share all breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    breakers: Arc<DashMap<DestinationId, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, breakers: Arc::new(DashMap::new()) }
    }

    /// Breaker for `destination_id`, created closed if absent.
    pub fn breaker(&self, destination_id: &DestinationId) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(destination_id) {
            return existing.clone();
        }

        self.breakers
            .entry(destination_id.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    destination_id.clone(),
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Breaker for `destination_id` if one was ever created.
    pub fn get(&self, destination_id: &DestinationId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(destination_id).map(|entry| entry.clone())
    }

    /// Snapshot of every breaker's state.
    pub fn states(&self) -> Vec<(DestinationId, CircuitBreakerState)> {
        self.breakers.iter().map(|entry| (entry.key().clone(), entry.value().state())).collect()
    }

    /// Resets the breaker for `destination_id`. Returns `false` if none exists.
    pub fn reset(&self, destination_id: &DestinationId) -> bool {
        self.get(destination_id).map(|breaker| breaker.reset()).is_some()
    }

    /// Number of destinations with a breaker.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Shared configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
            half_open_max_calls: 2,
        }
    }

    fn breaker(clock: &TestClock) -> CircuitBreaker {
        CircuitBreaker::new(DestinationId::new("test-destination"), test_config(), Arc::new(clock.clone()))
    }

    fn open(breaker: &CircuitBreaker) {
        for _ in 0..3 {
            breaker.record_failure();
        }
    }

    #[test]
    fn circuit_starts_closed() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        assert!(breaker.can_execute());
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert_eq!(breaker.next_attempt_delay(), Duration::ZERO);
    }

    #[test]
    fn consecutive_failures_open_circuit() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        for _ in 0..2 {
            breaker.record_failure();
            assert!(breaker.can_execute());
        }

        breaker.record_failure();
        assert!(!breaker.can_execute());
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_counter() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state().consecutive_failures, 2);

        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert_eq!(breaker.state().consecutive_failures, 2);
    }

    #[test]
    fn next_attempt_delay_counts_down_while_open() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        open(&breaker);

        assert_eq!(breaker.next_attempt_delay(), Duration::from_secs(10));

        clock.advance(Duration::from_secs(4));
        assert_eq!(breaker.next_attempt_delay(), Duration::from_secs(6));
    }

    #[test]
    fn open_circuit_transitions_to_half_open_after_recovery_timeout() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        open(&breaker);

        clock.advance(Duration::from_millis(9_999));
        assert!(!breaker.can_execute());

        clock.advance(Duration::from_millis(1));
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute());
    }

    #[test]
    fn half_open_limits_probe_calls() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        open(&breaker);
        clock.advance(Duration::from_secs(10));

        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());
        assert_eq!(breaker.next_attempt_delay(), Duration::from_secs(10));
    }

    #[test]
    fn half_open_successes_close_circuit() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        open(&breaker);
        clock.advance(Duration::from_secs(10));

        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);

        assert!(breaker.can_execute());
        breaker.record_success();

        let state = breaker.state();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.consecutive_successes, 0);
    }

    #[test]
    fn half_open_failure_reopens_circuit() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        open(&breaker);
        clock.advance(Duration::from_secs(10));

        assert!(breaker.can_execute());
        breaker.record_success();
        breaker.record_failure();

        let state = breaker.state();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.consecutive_successes, 0);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.next_attempt_delay(), Duration::from_secs(10));
    }

    #[test]
    fn check_returns_circuit_open_error_with_delay() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        assert!(breaker.check().is_ok());

        open(&breaker);
        clock.advance(Duration::from_secs(3));

        let Err(DeliveryError::CircuitOpen { destination_id, retry_after }) = breaker.check() else {
            unreachable!("expected circuit open error");
        };
        assert_eq!(destination_id, "test-destination");
        assert_eq!(retry_after, Duration::from_secs(7));
    }

    #[test]
    fn reset_closes_circuit() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        open(&breaker);

        breaker.reset();

        assert!(breaker.can_execute());
        assert_eq!(breaker.state().consecutive_failures, 0);
    }

    #[test]
    fn registry_creates_breakers_lazily_and_shares_them() {
        let clock = TestClock::new();
        let registry = CircuitBreakerRegistry::new(test_config(), Arc::new(clock));
        let destination = DestinationId::new("orders");

        assert!(registry.get(&destination).is_none());
        assert!(!registry.reset(&destination));

        let first = registry.breaker(&destination);
        let second = registry.breaker(&destination);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        open(&first);
        let healthy = registry.breaker(&DestinationId::new("invoices"));
        assert!(healthy.can_execute());
        assert_eq!(second.current_state(), CircuitState::Open);

        assert!(registry.reset(&destination));
        assert_eq!(first.current_state(), CircuitState::Closed);
    }
}
