//! # Scaffold Guard
//!
//! The guarded execution layer of a project bootstrapper. A bootstrapper is
//! asked to write into user-supplied paths and to run user-influenced
//! commands; this crate provides the primitives that let it do so without
//! path traversal, shell injection, half-written files or runaway retries.
//!
//! ## Trust Model
//!
//! The invoking process is trusted. Its *inputs* (paths, command arguments,
//! file contents) are not. This is not a sandbox: there is no syscall
//! filtering and no container isolation.
//!
//! ## Components
//!
//! - **`path_guard`**: Resolves requested paths against a [`Root`], following
//!   every symlink, and hands out [`GuardedPath`] capabilities. Nothing else
//!   can construct one.
//! - **`command_guard`**: Validates a structured [`CommandSpec`] against an
//!   allowlist of trusted executables. Commands are never run through a
//!   shell.
//! - **`retry`**: Stateless backoff decisions per [`ErrorClass`].
//! - **`circuit_breaker`**: One breaker per external tool, so a failing
//!   linter does not block the package manager.
//! - **`safe_fs`**: Atomic writes (temp file, sync, rename) and idempotent
//!   directory creation on top of [`GuardedPath`].
//! - **`process`**: [`SafeProcessRunner`] ties the command guard, retry
//!   policy and breakers together and enforces hard timeouts.
//! - **`events`**: Structured [`GuardEvent`]s for the caller's reporting.
//! - **`config`**: [`GuardConfig`] loaded from TOML or JSON.
//! - **`validators`**: Project name checks for the scaffold target.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scaffold_guard::{AtomicWriteIntent, CommandSpec, GuardConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = GuardConfig::load_from_file("guard.toml".as_ref())?;
//! let fs = config.file_system("/tmp/proj")?;
//! let runner = config.build_runner()?;
//!
//! let dest = fs.guard().resolve("config/app.toml")?;
//! fs.write_atomic(AtomicWriteIntent::new(dest, "x=1")).await?;
//!
//! let output = runner.run(&CommandSpec::new("git").arg("init")).await?;
//! println!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod command_guard;
pub mod config;
pub mod error;
pub mod events;
pub mod path_guard;
pub mod process;
pub mod retry;
pub mod safe_fs;
pub mod utils;
pub mod validators;

pub use circuit_breaker::{
    BreakerConfig, BreakerPermit, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
    Transition,
};
pub use command_guard::{Allowlist, CommandGuard, CommandSpec, EnvPolicy, ValidatedCommand};
pub use config::GuardConfig;
pub use error::{ErrorClass, GuardError, GuardResult};
pub use events::{
    ChannelEventSink, EventSink, GuardEvent, NoOpEventSink, SinkError, TracingEventSink,
};
pub use path_guard::{GuardedPath, PathGuard, Root, guard_file_extension};
pub use process::{ExitCodePolicy, ProcessOutput, SafeProcessRunner};
pub use retry::{BackoffStrategy, RetryConfig, RetryDecision, RetryPolicy, classify_message};
pub use safe_fs::{AtomicWriteIntent, MaterializeOutcome, SafeFileSystem};
pub use validators::{ProjectNameError, ProjectNameOptions, validate_project_name};
