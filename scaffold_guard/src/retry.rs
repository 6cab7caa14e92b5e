//! Retry Decisions with Exponential Backoff
//!
//! [`RetryPolicy`] is a pure decision function: given how many attempts have
//! been made, how long they took and how the last failure was classified, it
//! answers "wait this long and try again" or "give up". It keeps no history;
//! the caller threads attempt counts through (see
//! [`crate::process::SafeProcessRunner`]).
//!
//! ## Key Features
//!
//! - **Exponential Backoff**: Delays grow exponentially (100ms, 200ms, 400ms...)
//! - **Max Delay Cap**: Prevents unbounded delay growth
//! - **Proportional Jitter**: Randomizes each delay by up to `jitter_ratio` of its
//!   value so invocations that fail together do not retry in lockstep
//! - **Error Classes**: `Permanent` never retries, `Unknown` gets a lower cap

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ErrorClass;
use crate::utils::time::{duration_ms, option_duration_ms};

/// How the base delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Delays grow exponentially: initial_delay * backoff_factor^retry
    #[default]
    ExponentialBackoff,
    /// Fixed delay between all retries
    FixedDelay,
    /// No delay between retries
    Immediate,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of attempts, counting the first one.
    pub max_attempts: u32,
    /// Attempt cap applied to `Unknown`-classified failures.
    pub unknown_max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Maximum delay cap (prevents unbounded growth)
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry delay
    pub backoff_factor: f64,
    pub strategy: BackoffStrategy,
    /// Jitter as a fraction of the computed delay, in `[0, 1]`. Zero disables it.
    pub jitter_ratio: f64,
    /// Optional budget for total time spent across attempts and delays.
    #[serde(
        with = "option_duration_ms",
        rename = "max_elapsed_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            unknown_max_attempts: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            strategy: BackoffStrategy::ExponentialBackoff,
            jitter_ratio: 0.2,
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_unknown_max_attempts(mut self, max_attempts: u32) -> Self {
        self.unknown_max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff factor (multiplier for each retry)
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    /// Describe every incoherent parameter. Empty means the config is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.unknown_max_attempts == 0 {
            problems.push("retry.unknown_max_attempts must be at least 1".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            problems.push(format!(
                "retry.backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        if self.initial_delay > self.max_delay {
            problems.push(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.initial_delay.as_millis(),
                self.max_delay.as_millis()
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            problems.push(format!(
                "retry.jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            ));
        }
        problems
    }

    /// Calculate the un-jittered delay before retry number `retry` (0-indexed).
    ///
    /// Non-decreasing in `retry` whenever `backoff_factor >= 1`, and never
    /// above `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::ExponentialBackoff => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let nanos =
                    self.initial_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
                if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
                    self.max_delay
                } else {
                    Duration::from_nanos(nanos.max(0.0) as u64)
                }
            }
            BackoffStrategy::FixedDelay => self.initial_delay,
            BackoffStrategy::Immediate => Duration::ZERO,
        };

        // Cap at max_delay
        std::cmp::min(delay, self.max_delay)
    }

    /// Calculate delay with jitter of up to ±`jitter_ratio` of the base delay,
    /// still bounded by `max_delay`.
    pub fn delay_for_attempt_with_jitter(&self, retry: u32) -> Duration {
        let base_delay = self.delay_for_attempt(retry);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || base_delay.is_zero() {
            return base_delay;
        }

        let base_secs = base_delay.as_secs_f64();
        let jitter_range = base_secs * ratio;
        let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
        let jittered = Duration::from_secs_f64((base_secs + jitter).max(0.0));

        std::cmp::min(jittered, self.max_delay)
    }

    fn attempt_cap(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Permanent => 0,
            ErrorClass::Transient => self.max_attempts,
            ErrorClass::Unknown => self.unknown_max_attempts.min(self.max_attempts),
        }
    }
}

/// The outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryDecision {
    pub fn is_give_up(&self) -> bool {
        matches!(self, RetryDecision::GiveUp)
    }
}

/// Stateless retry decision function over a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what to do after `attempt` attempts (1-based) have failed, the
    /// last one with `class`.
    pub fn next_delay(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if attempt >= self.config.attempt_cap(class) {
            return RetryDecision::GiveUp;
        }
        let retry = attempt.saturating_sub(1);
        RetryDecision::RetryAfter(self.config.delay_for_attempt_with_jitter(retry))
    }

    /// Like [`RetryPolicy::next_delay`], additionally giving up when waiting
    /// would exceed the configured elapsed-time budget.
    pub fn decide(&self, attempt: u32, elapsed: Duration, class: ErrorClass) -> RetryDecision {
        match self.next_delay(attempt, class) {
            RetryDecision::RetryAfter(delay) => match self.config.max_elapsed {
                Some(budget) if elapsed.saturating_add(delay) > budget => RetryDecision::GiveUp,
                _ => RetryDecision::RetryAfter(delay),
            },
            RetryDecision::GiveUp => RetryDecision::GiveUp,
        }
    }
}

/// Patterns indicating transient (retryable) errors
const RETRYABLE_PATTERNS: &[&str] = &[
    // Timeout-related
    "timed out",
    "timeout",
    "etimedout",
    // Resource exhaustion
    "resource temporarily unavailable",
    "eagain",
    "resource busy",
    "too many open files",
    // Network issues
    "connection reset",
    "broken pipe",
    "network is unreachable",
    "connection refused",
    "no route to host",
    "could not resolve host",
    "temporary failure in name resolution",
    // I/O retry scenarios
    "interrupted system call",
    "eintr",
];

/// Patterns indicating permanent (non-retryable) errors
const PERMANENT_PATTERNS: &[&str] = &[
    // Permission issues
    "permission denied",
    "access denied",
    "operation not permitted",
    // File/path issues
    "no such file or directory",
    "file not found",
    "not a directory",
    "is a directory",
    // Command issues
    "command not found",
    "syntax error",
    "invalid argument",
    "invalid option",
    "unrecognized option",
    // Authentication
    "authentication failed",
    "unauthorized",
];

/// Classify a failure message (typically a tool's stderr).
///
/// Permanent patterns win over transient ones; anything unrecognised is
/// `Unknown`.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Permanent;
    }
    if RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Unknown
}
