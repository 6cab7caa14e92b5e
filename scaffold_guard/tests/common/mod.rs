//! Shared helpers for scaffold_guard integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use scaffold_guard::{
    Allowlist, BreakerConfig, BreakerRegistry, CommandGuard, EnvPolicy, GuardEvent, RetryConfig,
    RetryPolicy, SafeProcessRunner, events,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Executables used by the process tests. None of them is a shell.
pub const TOOLS: &[(&str, &str)] = &[
    ("echo", "/bin/echo"),
    ("printf", "/usr/bin/printf"),
    ("env", "/usr/bin/env"),
    ("pwd", "/bin/pwd"),
    ("sleep", "/bin/sleep"),
    ("true", "/bin/true"),
    ("false", "/bin/false"),
    ("ghost", "/nonexistent/bin/ghost"),
];

pub fn allowlist() -> Allowlist {
    let mut allowlist = Allowlist::new();
    for (name, path) in TOOLS {
        allowlist.insert(*name, *path).unwrap();
    }
    allowlist
}

/// Short, jitter-free backoff so retry tests stay fast and deterministic.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        RetryConfig::new()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter_ratio(0.0),
    )
}

pub fn breakers(threshold: u32) -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(BreakerConfig::new(
        threshold,
        Duration::from_secs(60),
    )))
}

/// A runner over [`TOOLS`] that reports events to the returned receiver.
pub fn runner(
    max_attempts: u32,
    threshold: u32,
    env_keys: &[&str],
) -> (SafeProcessRunner, UnboundedReceiver<GuardEvent>) {
    let (sink, rx) = events::channel_sink();
    let guard = CommandGuard::new(allowlist(), EnvPolicy::new(env_keys.iter().copied()));
    let runner = SafeProcessRunner::new(guard)
        .with_retry_policy(fast_retry(max_attempts))
        .with_breakers(breakers(threshold))
        .with_default_timeout(Duration::from_secs(10))
        .with_event_sink(sink);
    (runner, rx)
}

/// Everything currently queued on `rx`.
pub fn drain(rx: &mut UnboundedReceiver<GuardEvent>) -> Vec<GuardEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
