//! Structured events emitted by the guarded execution layer.
//!
//! The layer never formats user-facing text. Guard rejections, breaker
//! transitions and retry activity are handed to an [`EventSink`] as
//! [`GuardEvent`] values; the caller decides how to present them.
//!
//! - [`TracingEventSink`]: writes each event through `tracing` (the default).
//! - [`ChannelEventSink`]: forwards events over a tokio channel, for drivers
//!   that aggregate results.
//! - [`NoOpEventSink`]: drops everything.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::circuit_breaker::{BreakerState, Transition};
use crate::error::{ErrorClass, GuardError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardEvent {
    /// A requested path failed validation.
    PathRejected { requested: String, reason: String },
    /// A command spec failed validation.
    CommandRejected { executable: String, reason: String },
    /// A circuit breaker changed state.
    BreakerTransition {
        tool: String,
        from: BreakerState,
        to: BreakerState,
        consecutive_failures: u32,
    },
    /// A process attempt failed.
    AttemptFailed {
        tool: String,
        attempt: u32,
        class: ErrorClass,
        error: String,
    },
    /// Another attempt will follow after `delay_ms`.
    RetryScheduled {
        tool: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// The runner stopped retrying.
    GaveUp {
        tool: String,
        attempts: u32,
        class: ErrorClass,
    },
}

impl GuardEvent {
    /// Build the rejection event for a guard error, if it is one.
    pub fn rejection(error: &GuardError) -> Option<Self> {
        match error {
            GuardError::PathEscape { requested, .. } => Some(GuardEvent::PathRejected {
                requested: requested.clone(),
                reason: error.to_string(),
            }),
            GuardError::InvalidPath { requested, reason } => Some(GuardEvent::PathRejected {
                requested: requested.clone(),
                reason: reason.clone(),
            }),
            GuardError::CommandRejected { executable, reason } => {
                Some(GuardEvent::CommandRejected {
                    executable: executable.clone(),
                    reason: reason.clone(),
                })
            }
            _ => None,
        }
    }
}

impl From<Transition> for GuardEvent {
    fn from(t: Transition) -> Self {
        GuardEvent::BreakerTransition {
            tool: t.tool,
            from: t.from,
            to: t.to,
            consecutive_failures: t.consecutive_failures,
        }
    }
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardEvent::PathRejected { requested, reason } => {
                write!(f, "path '{requested}' rejected: {reason}")
            }
            GuardEvent::CommandRejected { executable, reason } => {
                write!(f, "command '{executable}' rejected: {reason}")
            }
            GuardEvent::BreakerTransition {
                tool,
                from,
                to,
                consecutive_failures,
            } => write!(
                f,
                "[{tool}] breaker {from} -> {to} ({consecutive_failures} consecutive failures)"
            ),
            GuardEvent::AttemptFailed {
                tool,
                attempt,
                class,
                error,
            } => write!(f, "[{tool}] attempt {attempt} failed ({class}): {error}"),
            GuardEvent::RetryScheduled {
                tool,
                attempt,
                delay_ms,
            } => write!(f, "[{tool}] attempt {attempt} in {delay_ms}ms"),
            GuardEvent::GaveUp {
                tool,
                attempts,
                class,
            } => write!(f, "[{tool}] gave up after {attempts} attempt(s) ({class})"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Event receiver disconnected")]
    Disconnected,
}

/// Receives [`GuardEvent`]s from the guarded execution layer.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: GuardEvent) -> Result<(), SinkError>;
}

/// Logs each event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: GuardEvent) -> Result<(), SinkError> {
        match &event {
            GuardEvent::PathRejected { .. } | GuardEvent::CommandRejected { .. } => {
                tracing::warn!(target: "scaffold_guard::events", "{event}")
            }
            GuardEvent::BreakerTransition { to, .. } if *to == BreakerState::Open => {
                tracing::warn!(target: "scaffold_guard::events", "{event}")
            }
            GuardEvent::GaveUp { .. } => {
                tracing::error!(target: "scaffold_guard::events", "{event}")
            }
            _ => tracing::info!(target: "scaffold_guard::events", "{event}"),
        }
        Ok(())
    }
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<GuardEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<GuardEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: GuardEvent) -> Result<(), SinkError> {
        self.sender.send(event).map_err(|_| SinkError::Disconnected)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: GuardEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// The default sink.
pub fn tracing_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingEventSink)
}

/// A channel sink together with its receiver.
pub fn channel_sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<GuardEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(ChannelEventSink::new(sender)), receiver)
}

/// Emit `event`, logging rather than propagating a sink failure.
pub(crate) async fn report(sink: &dyn EventSink, event: GuardEvent) {
    if let Err(e) = sink.emit(event).await {
        tracing::debug!("dropping guard event: {e}");
    }
}
