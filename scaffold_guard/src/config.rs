//! # Guard Configuration
//!
//! Everything the guarded execution layer treats as immutable input for a
//! bootstrap run: the command allowlist, permitted environment overrides,
//! retry and breaker parameters, the exit-code policy and timeouts.
//!
//! Configuration is read from TOML or JSON, chosen by file extension:
//!
//! ```toml
//! default_timeout_ms = 60000
//! allowed_env_keys = ["NO_COLOR", "UV_CACHE_DIR"]
//!
//! [allowlist]
//! git = "/usr/bin/git"
//! uv = "/usr/local/bin/uv"
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 200
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown_ms = 30000
//!
//! [exit_codes]
//! permanent = [2, 126, 127]
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{BreakerConfig, BreakerRegistry};
use crate::command_guard::{Allowlist, CommandGuard, EnvPolicy};
use crate::error::{GuardError, GuardResult};
use crate::path_guard::{PathGuard, Root};
use crate::process::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT, ExitCodePolicy, SafeProcessRunner};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::safe_fs::SafeFileSystem;
use crate::utils::time::duration_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    /// Logical tool name to absolute executable path.
    pub allowlist: Allowlist,
    /// Environment variables commands may override.
    pub allowed_env_keys: EnvPolicy,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub exit_codes: ExitCodePolicy,
    /// Timeout for commands that do not set their own.
    #[serde(with = "duration_ms", rename = "default_timeout_ms")]
    pub default_timeout: Duration,
    /// Bytes kept from each of a command's stdout and stderr.
    pub max_output_bytes: usize,
    /// Allow filesystem operations on the scaffold root itself.
    pub allow_root_writes: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            allowlist: Allowlist::default(),
            allowed_env_keys: EnvPolicy::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            exit_codes: ExitCodePolicy::default(),
            default_timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            allow_root_writes: false,
        }
    }
}

impl GuardConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read guard config '{}'", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&contents)
                .with_context(|| format!("Invalid TOML in '{}'", path.display())),
            Some("json") => serde_json::from_str(&contents)
                .with_context(|| format!("Invalid JSON in '{}'", path.display())),
            _ => bail!(
                "Unsupported config format for '{}': expected a .toml or .json file",
                path.display()
            ),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Describe every incoherent parameter. Empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (name, path) in self.allowlist.iter() {
            if name.is_empty() {
                problems.push("allowlist contains an empty tool name".to_string());
            }
            if !path.is_absolute() {
                problems.push(format!(
                    "allowlist entry '{name}' must be an absolute path, got '{}'",
                    path.display()
                ));
            }
        }
        for key in self.allowed_env_keys.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                problems.push(format!("allowed_env_keys contains malformed key '{key}'"));
            }
        }
        if self.default_timeout.is_zero() {
            problems.push("default_timeout_ms must be greater than zero".to_string());
        }
        if self.max_output_bytes == 0 {
            problems.push("max_output_bytes must be greater than zero".to_string());
        }

        problems.extend(self.retry.problems());
        problems.extend(self.breaker.problems());
        problems.extend(self.exit_codes.problems());
        problems
    }

    /// Allowlist entries whose executable is missing or not a file.
    pub fn missing_executables(&self) -> Vec<(String, std::path::PathBuf)> {
        self.allowlist
            .iter()
            .filter(|(_, path)| !path.is_file())
            .map(|(name, path)| (name.to_string(), path.to_path_buf()))
            .collect()
    }

    fn ensure_valid(&self) -> GuardResult<()> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(GuardError::Config(problems.join("; ")))
        }
    }

    pub fn command_guard(&self) -> CommandGuard {
        CommandGuard::new(self.allowlist.clone(), self.allowed_env_keys.clone())
    }

    /// A runner wired from this configuration.
    pub fn build_runner(&self) -> GuardResult<SafeProcessRunner> {
        self.ensure_valid()?;
        Ok(SafeProcessRunner::new(self.command_guard())
            .with_retry_policy(RetryPolicy::new(self.retry.clone()))
            .with_breakers(Arc::new(BreakerRegistry::new(self.breaker.clone())))
            .with_exit_codes(self.exit_codes.clone())
            .with_default_timeout(self.default_timeout)
            .with_max_output_bytes(self.max_output_bytes))
    }

    pub fn path_guard(&self, root: impl AsRef<Path>) -> GuardResult<PathGuard> {
        Ok(PathGuard::new(Root::new(root)?).with_allow_root(self.allow_root_writes))
    }

    pub fn file_system(&self, root: impl AsRef<Path>) -> GuardResult<SafeFileSystem> {
        Ok(SafeFileSystem::new(self.path_guard(root)?))
    }
}
