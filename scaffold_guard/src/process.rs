//! # Guarded Process Execution
//!
//! [`SafeProcessRunner`] runs external tools described by a [`CommandSpec`].
//! Each invocation:
//!
//! 1. passes the spec through [`CommandGuard`]; a rejection is returned at
//!    once and never retried;
//! 2. asks the tool's [`CircuitBreaker`](crate::circuit_breaker::CircuitBreaker)
//!    for admission before every attempt, failing with
//!    [`GuardError::CircuitOpen`] while it is open;
//! 3. runs the process under a hard wall-clock timeout, killing the child on
//!    expiry and discarding whatever output it had produced;
//! 4. classifies a failed attempt, reports it to the breaker and consults
//!    the [`RetryPolicy`], surfacing [`GuardError::RetriesExhausted`] when
//!    the policy gives up.
//!
//! Captured output is capped at [`DEFAULT_MAX_OUTPUT_BYTES`] per stream
//! unless configured otherwise. Pipes are drained past the cap so a chatty
//! child never blocks on a full pipe.
//!
//! Backoff waits are `tokio` timers, so unrelated tasks keep running.
//! Children are spawned with `kill_on_drop`, so dropping a `run` future
//! terminates any process it started.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::BreakerRegistry;
use crate::command_guard::{CommandGuard, CommandSpec, ValidatedCommand};
use crate::error::{ErrorClass, GuardError, GuardResult};
use crate::events::{self, EventSink, GuardEvent};
use crate::retry::{RetryDecision, RetryPolicy, classify_message};

/// Timeout applied when neither the spec nor the runner configures one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Bytes kept from each of stdout and stderr by default.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    /// Stdout decoded as UTF-8, with invalid sequences replaced.
    pub stdout: String,
    pub stderr: String,
    /// Stdout exactly as the child wrote it, for binary output.
    pub stdout_bytes: Vec<u8>,
    /// True if either stream exceeded the output cap and was cut short.
    pub truncated: bool,
}

/// Maps process exit codes to retry classes.
///
/// Codes listed in `success` are successful runs. Other codes are looked up
/// in `permanent`, then `transient`; anything unlisted gets `default`,
/// unless `classify_stderr` is set and the captured stderr matches a known
/// transient or permanent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExitCodePolicy {
    pub success: Vec<i32>,
    pub permanent: Vec<i32>,
    pub transient: Vec<i32>,
    pub default: ErrorClass,
    pub classify_stderr: bool,
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        Self {
            success: vec![0],
            permanent: Vec::new(),
            transient: Vec::new(),
            default: ErrorClass::Transient,
            classify_stderr: false,
        }
    }
}

impl ExitCodePolicy {
    /// `None` for a successful exit, otherwise the failure class.
    pub fn classify(&self, exit_code: i32, stderr: &str) -> Option<ErrorClass> {
        if self.success.contains(&exit_code) {
            return None;
        }
        if self.permanent.contains(&exit_code) {
            return Some(ErrorClass::Permanent);
        }
        if self.transient.contains(&exit_code) {
            return Some(ErrorClass::Transient);
        }
        if self.classify_stderr {
            match classify_message(stderr) {
                ErrorClass::Unknown => {}
                class => return Some(class),
            }
        }
        Some(self.default)
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.success.is_empty() {
            problems.push("exit_codes.success must list at least one code".to_string());
        }
        for code in self.permanent.iter().chain(&self.transient) {
            if self.success.contains(code) {
                problems.push(format!(
                    "exit code {code} is listed both as success and as a failure"
                ));
            }
        }
        if let Some(code) = self.permanent.iter().find(|c| self.transient.contains(c)) {
            problems.push(format!(
                "exit code {code} is listed both as permanent and as transient"
            ));
        }
        problems
    }
}

/// Runs validated commands with timeouts, retries and circuit breaking.
#[derive(Clone)]
pub struct SafeProcessRunner {
    guard: CommandGuard,
    retry: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    exit_codes: ExitCodePolicy,
    default_timeout: Duration,
    max_output_bytes: usize,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SafeProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeProcessRunner")
            .field("guard", &self.guard)
            .field("retry", &self.retry)
            .field("exit_codes", &self.exit_codes)
            .field("default_timeout", &self.default_timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .finish_non_exhaustive()
    }
}

impl SafeProcessRunner {
    pub fn new(guard: CommandGuard) -> Self {
        Self {
            guard,
            retry: RetryPolicy::default(),
            breakers: Arc::new(BreakerRegistry::default()),
            exit_codes: ExitCodePolicy::default(),
            default_timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            sink: events::tracing_sink(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share breakers with other runners, e.g. across worker tasks.
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_exit_codes(mut self, exit_codes: ExitCodePolicy) -> Self {
        self.exit_codes = exit_codes;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Cap on the bytes kept from each output stream.
    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn command_guard(&self) -> &CommandGuard {
        &self.guard
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `spec` to completion.
    pub async fn run(&self, spec: &CommandSpec) -> GuardResult<ProcessOutput> {
        self.run_with_cancel(spec, &CancellationToken::new()).await
    }

    /// Run `spec`, stopping with [`GuardError::Cancelled`] if `cancel` fires.
    ///
    /// Cancellation kills a running child and interrupts a backoff wait. A
    /// cancelled attempt is not reported to the breaker.
    pub async fn run_with_cancel(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> GuardResult<ProcessOutput> {
        let command = match self.guard.validate(spec) {
            Ok(command) => command,
            Err(e) => {
                if let Some(event) = GuardEvent::rejection(&e) {
                    self.emit(event).await;
                }
                return Err(e);
            }
        };

        let tool = command.tool().to_string();
        let limit = command.timeout().unwrap_or(self.default_timeout);
        let breaker = self.breakers.breaker(&tool);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut permit = match breaker.acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(%tool, attempt, "circuit open, not running command");
                    return Err(e);
                }
            };
            if let Some(transition) = permit.take_transition() {
                self.emit(transition.into()).await;
            }

            tracing::debug!(%tool, attempt, args = ?command.args(), "running command");
            let error = match self.attempt(&command, limit, cancel).await {
                Ok(output) => match self.exit_codes.classify(output.exit_code, &output.stderr) {
                    None => {
                        if let Some(transition) = permit.success() {
                            self.emit(transition.into()).await;
                        }
                        return Ok(output);
                    }
                    Some(class) => GuardError::NonZeroExit {
                        tool: tool.clone(),
                        code: output.exit_code,
                        class,
                        stderr: output.stderr,
                    },
                },
                Err(e @ GuardError::Cancelled { .. }) => return Err(e),
                Err(e) => e,
            };

            let class = error.class();
            if let Some(transition) = permit.failure() {
                self.emit(transition.into()).await;
            }
            self.emit(GuardEvent::AttemptFailed {
                tool: tool.clone(),
                attempt,
                class,
                error: error.to_string(),
            })
            .await;

            match self.retry.decide(attempt, started.elapsed(), class) {
                RetryDecision::GiveUp => {
                    self.emit(GuardEvent::GaveUp {
                        tool: tool.clone(),
                        attempts: attempt,
                        class,
                    })
                    .await;
                    return Err(GuardError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                RetryDecision::RetryAfter(delay) => {
                    self.emit(GuardEvent::RetryScheduled {
                        tool: tool.clone(),
                        attempt: attempt + 1,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    })
                    .await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GuardError::Cancelled { tool }),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One spawn-and-wait under `limit`.
    async fn attempt(
        &self,
        command: &ValidatedCommand,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> GuardResult<ProcessOutput> {
        let tool = command.tool();
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| GuardError::LaunchFailed {
                tool: tool.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let interrupted = {
            let completion = async {
                let (out, err) = tokio::join!(
                    read_stream(stdout, self.max_output_bytes),
                    read_stream(stderr, self.max_output_bytes)
                );
                let status = child.wait().await;
                (status, out, err)
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Interrupt::Cancelled,
                _ = tokio::time::sleep(limit) => Interrupt::TimedOut,
                finished = completion => Interrupt::Finished(finished),
            }
        };

        let (status, stdout, stderr) = match interrupted {
            Interrupt::Finished(finished) => finished,
            Interrupt::TimedOut => {
                tracing::warn!(
                    tool,
                    limit_ms = limit.as_millis() as u64,
                    "command timed out, killing"
                );
                kill(&mut child, tool).await;
                return Err(GuardError::Timeout {
                    tool: tool.to_string(),
                    limit,
                });
            }
            Interrupt::Cancelled => {
                tracing::info!(tool, "command cancelled, killing");
                kill(&mut child, tool).await;
                return Err(GuardError::Cancelled {
                    tool: tool.to_string(),
                });
            }
        };

        let io_err = |e| GuardError::io(command.program(), e);
        let status = status.map_err(io_err)?;
        let stdout = stdout.map_err(io_err)?;
        let stderr = stderr.map_err(io_err)?;
        let truncated = stdout.truncated || stderr.truncated;
        if truncated {
            tracing::warn!(
                tool,
                max_bytes = self.max_output_bytes,
                "command output exceeded the capture limit and was truncated"
            );
        }
        Ok(ProcessOutput {
            exit_code: exit_code(&status),
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            stdout_bytes: stdout.bytes,
            truncated,
        })
    }

    async fn emit(&self, event: GuardEvent) {
        events::report(self.sink.as_ref(), event).await;
    }
}

type Finished = (
    std::io::Result<std::process::ExitStatus>,
    std::io::Result<Captured>,
    std::io::Result<Captured>,
);

enum Interrupt {
    Finished(Finished),
    TimedOut,
    Cancelled,
}

/// Bytes read from one pipe, at most `limit` of them.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read `stream` to EOF, keeping the first `limit` bytes.
async fn read_stream<R: AsyncRead + Unpin>(
    stream: Option<R>,
    limit: usize,
) -> std::io::Result<Captured> {
    let mut captured = Captured::default();
    let Some(mut stream) = stream else {
        return Ok(captured);
    };
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(captured);
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
}

async fn kill(child: &mut tokio::process::Child, tool: &str) {
    if let Err(e) = child.kill().await {
        tracing::warn!(tool, "failed to kill child process: {e}");
    }
}

/// The exit code, or `128 + signal` for a child terminated by a signal.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
