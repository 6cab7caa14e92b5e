//! # Logging Initialization
//!
//! Installs the process-wide `tracing` subscriber. The guarded execution layer
//! itself only emits structured events; callers decide where they go.
//!
//! - **Environment Filter**: `RUST_LOG` wins when set; otherwise the requested
//!   level applies everywhere and `scaffold_guard` logs at `debug`.
//! - **File Logging**: with `log_to_file = true`, events go to a daily rolling
//!   file in the user cache directory (via `directories`), without ANSI colors.
//! - **Stderr Fallback**: used when asked for, or when the cache directory is
//!   missing or not writable.
//!
//! Initialization runs at most once per process; later calls are no-ops.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Log file name inside the cache directory.
const LOG_FILE_NAME: &str = "scaffold_guard.log";

/// Initialize verbose logging for tests.
///
/// This configures a `trace`-level subscriber that logs to stderr.
pub fn init_test_logging() {
    // Stderr initialisation cannot fail; ignore the Ok.
    let _ = init_logging("trace", false);
}

/// Initializes the logging system.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for sinks that can fail
/// to open without changing callers.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},scaffold_guard=debug")));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("dev", "ScaffoldGuard", "scaffold_guard")
        {
            let log_dir = proj_dirs.cache_dir();

            // tracing_appender::rolling::daily panics on permission errors, so
            // check the directory first.
            if can_write_to(log_dir) {
                let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                let installed = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .try_init()
                    .is_ok();
                if installed {
                    // Leaked so buffered lines are flushed at exit.
                    Box::leak(Box::new(guard));
                }
                return;
            }
        }

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .try_init();
    });

    Ok(())
}

/// Test if we can write to the given directory, creating it if needed.
fn can_write_to(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let marker = dir.join(".scaffold_guard_write_check");
    match std::fs::write(&marker, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}
