//! Per-collaborator circuit breakers.
//!
//! A breaker trips `Open` after `failure_threshold` consecutive failures and
//! rejects calls with [`GuardError::CircuitOpen`] until its cooldown elapses.
//! The next call after that is admitted as the single `HalfOpen` trial: a
//! success closes the breaker, a failure re-opens it with a longer cooldown.
//!
//! All transitions happen under the breaker's own mutex and perform no I/O.
//! Every transition starts a new generation. A [`BreakerPermit`] remembers
//! the generation it was granted in, and its outcome is ignored once the
//! breaker has moved on, so a slow call admitted while `Closed` cannot settle
//! a later half-open trial.
//! Transitions are returned to the caller as [`Transition`] values so they
//! can be logged or forwarded; the breaker never swallows them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{GuardError, GuardResult};
use crate::utils::time::duration_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent `Open` before a trial call is admitted.
    #[serde(with = "duration_ms", rename = "cooldown_ms")]
    pub cooldown: Duration,
    /// Factor applied to the cooldown each time a trial call fails.
    pub cooldown_multiplier: f64,
    /// Upper bound for the extended cooldown.
    #[serde(with = "duration_ms", rename = "max_cooldown_ms")]
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            max_cooldown: cooldown.max(Self::default().max_cooldown),
            ..Self::default()
        }
    }

    pub fn with_cooldown_multiplier(mut self, multiplier: f64) -> Self {
        self.cooldown_multiplier = multiplier;
        self
    }

    pub fn with_max_cooldown(mut self, max: Duration) -> Self {
        self.max_cooldown = max;
        self
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.failure_threshold == 0 {
            problems.push("breaker.failure_threshold must be at least 1".to_string());
        }
        if !self.cooldown_multiplier.is_finite() || self.cooldown_multiplier < 1.0 {
            problems.push(format!(
                "breaker.cooldown_multiplier must be a finite number >= 1.0, got {}",
                self.cooldown_multiplier
            ));
        }
        if self.max_cooldown < self.cooldown {
            problems.push(format!(
                "breaker.max_cooldown_ms ({}) is below breaker.cooldown_ms ({})",
                self.max_cooldown.as_millis(),
                self.cooldown.as_millis()
            ));
        }
        problems
    }

    fn extended(&self, current: Duration) -> Duration {
        let nanos = current.as_nanos() as f64 * self.cooldown_multiplier;
        if !nanos.is_finite() || nanos >= self.max_cooldown.as_nanos() as f64 {
            self.max_cooldown
        } else {
            Duration::from_nanos(nanos as u64).max(current)
        }
    }
}

/// A state change, reported to the caller for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub tool: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub consecutive_failures: u32,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub tool: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub cooldown: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    generation: u64,
}

/// Circuit breaker for a single collaborator.
#[derive(Debug)]
pub struct CircuitBreaker {
    tool: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(tool: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            tool: tool.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                cooldown,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// The stored state. An `Open` breaker whose cooldown has elapsed still
    /// reports `Open` until the next [`CircuitBreaker::acquire`].
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            tool: self.tool.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            cooldown: inner.cooldown,
        }
    }

    /// Ask to make a call now.
    pub fn acquire(&self) -> GuardResult<BreakerPermit<'_>> {
        self.acquire_at(Instant::now())
    }

    /// Ask to make a call at `now`.
    ///
    /// Fails with [`GuardError::CircuitOpen`] while the breaker is open, or
    /// while another caller holds the half-open trial.
    pub fn acquire_at(&self, now: Instant) -> GuardResult<BreakerPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, false, inner.generation, None)),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let ready_at = opened_at + inner.cooldown;
                if now >= ready_at {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    let transition = self.transition(&mut inner, BreakerState::Open);
                    Ok(BreakerPermit::new(
                        self,
                        true,
                        inner.generation,
                        Some(transition),
                    ))
                } else {
                    Err(self.open_error(&inner, ready_at - now))
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error(&inner, Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self, true, inner.generation, None))
                }
            }
        }
    }

    /// Record a successful call.
    #[must_use = "breaker transitions should be reported"]
    pub fn record_success(&self) -> Option<Transition> {
        self.settle_success(None)
    }

    fn settle_success(&self, generation: Option<u64>) -> Option<Transition> {
        let mut inner = self.lock();
        if self.is_stale(&inner, generation) {
            return None;
        }
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
                inner.opened_at = None;
                inner.cooldown = self.config.cooldown;
                Some(self.transition(&mut inner, BreakerState::HalfOpen))
            }
            // A call admitted before the breaker tripped; the trip stands.
            BreakerState::Open => None,
        }
    }

    /// Record a failed call.
    #[must_use = "breaker transitions should be reported"]
    pub fn record_failure(&self) -> Option<Transition> {
        self.record_failure_at(Instant::now())
    }

    #[must_use = "breaker transitions should be reported"]
    pub fn record_failure_at(&self, now: Instant) -> Option<Transition> {
        self.settle_failure(None, now)
    }

    fn settle_failure(&self, generation: Option<u64>, now: Instant) -> Option<Transition> {
        let mut inner = self.lock();
        if self.is_stale(&inner, generation) {
            return None;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    Some(self.transition(&mut inner, BreakerState::Closed))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                inner.cooldown = self.config.extended(inner.cooldown);
                Some(self.transition(&mut inner, BreakerState::HalfOpen))
            }
            BreakerState::Open => None,
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen && inner.generation == generation {
            inner.trial_in_flight = false;
        }
    }

    fn is_stale(&self, inner: &BreakerInner, generation: Option<u64>) -> bool {
        match generation {
            Some(generation) if generation != inner.generation => {
                tracing::debug!(
                    tool = %self.tool,
                    state = %inner.state,
                    "ignoring outcome of a call admitted before the last transition"
                );
                true
            }
            _ => false,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, from: BreakerState) -> Transition {
        inner.generation = inner.generation.wrapping_add(1);
        tracing::debug!(
            tool = %self.tool,
            %from,
            to = %inner.state,
            failures = inner.consecutive_failures,
            "circuit breaker transition"
        );
        Transition {
            tool: self.tool.clone(),
            from,
            to: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn open_error(&self, inner: &BreakerInner, retry_in: Duration) -> GuardError {
        GuardError::CircuitOpen {
            tool: self.tool.clone(),
            consecutive_failures: inner.consecutive_failures,
            retry_in,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Each transition leaves the state consistent, so a panic elsewhere
        // while holding the lock cannot corrupt it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission to make one call through a [`CircuitBreaker`].
///
/// Settle it with [`BreakerPermit::success`] or [`BreakerPermit::failure`].
/// Dropping an unsettled half-open trial frees the trial slot without
/// counting an outcome, so an abandoned call cannot wedge the breaker.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
    transition: Option<Transition>,
}

impl<'a> BreakerPermit<'a> {
    fn new(
        breaker: &'a CircuitBreaker,
        trial: bool,
        generation: u64,
        transition: Option<Transition>,
    ) -> Self {
        Self {
            breaker,
            trial,
            generation,
            settled: false,
            transition,
        }
    }

    /// True if this is the single half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The transition caused by granting this permit (Open → HalfOpen).
    pub fn take_transition(&mut self) -> Option<Transition> {
        self.transition.take()
    }

    #[must_use = "breaker transitions should be reported"]
    pub fn success(mut self) -> Option<Transition> {
        self.settled = true;
        self.breaker.settle_success(Some(self.generation))
    }

    #[must_use = "breaker transitions should be reported"]
    pub fn failure(self) -> Option<Transition> {
        self.failure_at(Instant::now())
    }

    #[must_use = "breaker transitions should be reported"]
    pub fn failure_at(mut self, now: Instant) -> Option<Transition> {
        self.settled = true;
        self.breaker.settle_failure(Some(self.generation), now)
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Owns one breaker per collaborator, created lazily on first use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// The breaker for `tool`, creating it in the `Closed` state if needed.
    pub fn breaker(&self, tool: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(tool.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(tool, self.config.clone())))
            .clone()
    }

    /// The breaker for `tool` if one has been created.
    pub fn get(&self, tool: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
            .cloned()
    }

    /// Snapshots of every breaker, sorted by tool name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.tool.cmp(&b.tool));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "ruff",
            BreakerConfig::new(threshold, Duration::from_millis(cooldown_ms)),
        )
    }

    fn fail(b: &CircuitBreaker, now: Instant) -> Option<Transition> {
        b.acquire_at(now).unwrap().failure_at(now)
    }

    #[test]
    fn test_starts_closed() {
        let b = breaker(3, 100);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker(3, 100);
        let now = Instant::now();
        assert!(fail(&b, now).is_none());
        assert!(fail(&b, now).is_none());
        let t = fail(&b, now).unwrap();
        assert_eq!((t.from, t.to), (BreakerState::Closed, BreakerState::Open));
        assert_eq!(t.consecutive_failures, 3);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(3, 100);
        let now = Instant::now();
        let _ = fail(&b, now);
        let _ = fail(&b, now);
        assert!(b.acquire_at(now).unwrap().success().is_none());
        assert_eq!(b.failure_count(), 0);
        let _ = fail(&b, now);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        let b = breaker(1, 100);
        let now = Instant::now();
        let _ = fail(&b, now);

        match b.acquire_at(now + Duration::from_millis(40)).unwrap_err() {
            GuardError::CircuitOpen { retry_in, tool, .. } => {
                assert_eq!(tool, "ruff");
                assert_eq!(retry_in, Duration::from_millis(60));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let b = breaker(1, 100);
        let now = Instant::now();
        let _ = fail(&b, now);

        let later = now + Duration::from_millis(100);
        let mut trial = b.acquire_at(later).unwrap();
        assert!(trial.is_trial());
        let t = trial.take_transition().unwrap();
        assert_eq!((t.from, t.to), (BreakerState::Open, BreakerState::HalfOpen));

        assert!(matches!(
            b.acquire_at(later).unwrap_err(),
            GuardError::CircuitOpen { .. }
        ));

        let t = trial.success().unwrap();
        assert_eq!((t.from, t.to), (BreakerState::HalfOpen, BreakerState::Closed));
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
        assert!(!b.acquire_at(later).unwrap().is_trial());
    }

    #[test]
    fn test_failed_trial_reopens_with_extended_cooldown() {
        let b = breaker(1, 100);
        let now = Instant::now();
        let _ = fail(&b, now);

        let trial_at = now + Duration::from_millis(100);
        let t = b.acquire_at(trial_at).unwrap().failure_at(trial_at).unwrap();
        assert_eq!((t.from, t.to), (BreakerState::HalfOpen, BreakerState::Open));
        assert_eq!(b.snapshot().cooldown, Duration::from_millis(200));

        // The old cooldown is no longer enough.
        assert!(b.acquire_at(trial_at + Duration::from_millis(150)).is_err());
        let mut retry = b.acquire_at(trial_at + Duration::from_millis(200)).unwrap();
        assert!(retry.take_transition().is_some());

        // Closing resets the cooldown.
        let _ = retry.success();
        assert_eq!(b.snapshot().cooldown, Duration::from_millis(100));
    }

    #[test]
    fn test_extended_cooldown_is_capped() {
        let config = BreakerConfig::new(1, Duration::from_millis(100))
            .with_cooldown_multiplier(10.0)
            .with_max_cooldown(Duration::from_millis(250));
        assert_eq!(config.extended(Duration::from_millis(100)), Duration::from_millis(250));
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let b = breaker(1, 10);
        let now = Instant::now();
        let _ = fail(&b, now);

        let later = now + Duration::from_millis(10);
        drop(b.acquire_at(later).unwrap());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.acquire_at(later).unwrap().is_trial());
    }

    #[test]
    fn test_late_outcome_cannot_settle_trial() {
        let b = breaker(1, 100);
        let now = Instant::now();
        let slow_success = b.acquire_at(now).unwrap();
        let slow_failure = b.acquire_at(now).unwrap();
        let _ = fail(&b, now);

        let later = now + Duration::from_millis(100);
        let trial = b.acquire_at(later).unwrap();
        assert!(trial.is_trial());

        // Both calls were admitted while closed; the breaker has moved on.
        assert!(slow_success.success().is_none());
        assert!(slow_failure.failure_at(later).is_none());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.snapshot().cooldown, Duration::from_millis(100));
        assert!(b.acquire_at(later).is_err());

        let t = trial.success().unwrap();
        assert_eq!(t.to, BreakerState::Closed);
    }

    #[test]
    fn test_late_outcome_after_close_is_ignored() {
        let b = breaker(1, 100);
        let now = Instant::now();
        let stale = b.acquire_at(now).unwrap();
        let _ = fail(&b, now);
        let later = now + Duration::from_millis(100);
        let _ = b.acquire_at(later).unwrap().success();
        assert_eq!(b.state(), BreakerState::Closed);

        // Admitted before the trip; its failure must not re-trip the breaker.
        assert!(stale.failure_at(later).is_none());
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_stale_trial_drop_keeps_new_trial() {
        let b = breaker(1, 10);
        let now = Instant::now();
        let _ = fail(&b, now);

        let later = now + Duration::from_millis(10);
        let old_trial = b.acquire_at(later).unwrap();
        // A direct record closes the breaker and a new trip follows.
        let _ = b.record_success();
        let _ = fail(&b, later);
        let new_trial = b.acquire_at(later + Duration::from_millis(10)).unwrap();
        assert!(new_trial.is_trial());

        drop(old_trial);
        assert!(b.acquire_at(later + Duration::from_millis(10)).is_err());
        drop(new_trial);
    }

    #[test]
    fn test_concurrent_failures_counted_exactly() {
        let b = Arc::new(breaker(1_000, 100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = b.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _ = b.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(b.failure_count(), 800);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_concurrent_threshold_crossing_reports_one_transition() {
        let b = Arc::new(breaker(50, 100));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let b = b.clone();
                thread::spawn(move || (0..10).filter_map(|_| b.record_failure()).count())
            })
            .collect();
        let transitions: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(transitions, 1);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_registry_isolates_tools() {
        let registry = BreakerRegistry::new(BreakerConfig::new(1, Duration::from_secs(60)));
        let _ = registry.breaker("ruff").record_failure();

        assert_eq!(registry.breaker("ruff").state(), BreakerState::Open);
        assert_eq!(registry.breaker("uv").state(), BreakerState::Closed);
        assert!(Arc::ptr_eq(&registry.breaker("ruff"), &registry.breaker("ruff")));

        let snapshot = registry.snapshot();
        let tools: Vec<_> = snapshot.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools, ["ruff", "uv"]);
        assert!(registry.get("mypy").is_none());
    }

    #[test]
    fn test_config_problems() {
        let bad = BreakerConfig {
            failure_threshold: 0,
            cooldown_multiplier: 0.5,
            cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(1),
        };
        assert_eq!(bad.problems().len(), 3);
        assert!(BreakerConfig::default().problems().is_empty());
    }
}
