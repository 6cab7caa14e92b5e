use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network hiccups, timeouts, busy resources. Worth another attempt.
    Transient,
    /// Validation failures and guard rejections. Never retried.
    Permanent,
    /// Not recognised. Retried like `Transient`, but with a lower attempt cap.
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Errors raised by the guarded execution layer.
///
/// Every variant is terminal for the operation that produced it. Only the
/// process runner retries, and only through its retry policy and breaker.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Path '{requested}' escapes the scaffold root '{}'", root.display())]
    PathEscape { requested: String, root: PathBuf },

    #[error("Path '{requested}' is invalid: {reason}")]
    InvalidPath { requested: String, reason: String },

    #[error("Path '{}' conflicts with an existing entry: {reason}", path.display())]
    PathConflict { path: PathBuf, reason: String },

    #[error("Destination '{}' already exists", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Command '{executable}' rejected: {reason}")]
    CommandRejected { executable: String, reason: String },

    #[error(
        "Circuit open for '{tool}' after {consecutive_failures} consecutive failures (retry in {}ms)",
        retry_in.as_millis()
    )]
    CircuitOpen {
        tool: String,
        consecutive_failures: u32,
        retry_in: Duration,
    },

    #[error("Command '{tool}' timed out after {}ms", limit.as_millis())]
    Timeout { tool: String, limit: Duration },

    #[error("Command '{tool}' was cancelled")]
    Cancelled { tool: String },

    #[error("Failed to launch '{tool}': {source}")]
    LaunchFailed {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{tool}' exited with code {code}")]
    NonZeroExit {
        tool: String,
        code: i32,
        class: ErrorClass,
        stderr: String,
    },

    #[error("Gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GuardError>,
    },

    #[error("I/O failure on '{}': {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid guard configuration: {0}")]
    Config(String),
}

impl GuardError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GuardError::IoFailure {
            path: path.into(),
            source,
        }
    }

    /// The retry classification of this error.
    ///
    /// Guard rejections are always permanent: retrying a rejected input can
    /// never succeed.
    pub fn class(&self) -> ErrorClass {
        match self {
            GuardError::PathEscape { .. }
            | GuardError::InvalidPath { .. }
            | GuardError::PathConflict { .. }
            | GuardError::AlreadyExists { .. }
            | GuardError::CommandRejected { .. }
            | GuardError::LaunchFailed { .. }
            | GuardError::Cancelled { .. }
            | GuardError::Config(_) => ErrorClass::Permanent,
            GuardError::CircuitOpen { .. } | GuardError::Timeout { .. } => ErrorClass::Transient,
            GuardError::NonZeroExit { class, .. } => *class,
            GuardError::RetriesExhausted { last, .. } => last.class(),
            GuardError::IoFailure { .. } => ErrorClass::Unknown,
        }
    }

    /// True for rejections produced by the path or command guards.
    pub fn is_guard_rejection(&self) -> bool {
        matches!(
            self,
            GuardError::PathEscape { .. }
                | GuardError::InvalidPath { .. }
                | GuardError::CommandRejected { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type GuardResult<T> = std::result::Result<T, GuardError>;
