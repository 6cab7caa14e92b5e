//! Structural validation of external command invocations.
//!
//! A command is always an executable plus an argument vector. Nothing in this
//! module (or anywhere in the crate) joins arguments into a single string or
//! hands them to a shell, so shell metacharacters in arguments are inert by
//! construction. The guard therefore does not filter argument content beyond
//! rejecting NUL bytes, which cannot be passed through `execve` anyway.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, GuardResult};
use crate::path_guard::GuardedPath;

/// A structured request to run an allowlisted tool.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Logical tool name, looked up in the [`Allowlist`].
    pub executable: String,
    pub args: Vec<String>,
    /// Working directory. Must already be confined to the scaffold root.
    pub working_dir: Option<GuardedPath>,
    /// Per-invocation timeout. Falls back to the runner default.
    pub timeout: Option<Duration>,
    /// Environment overrides. Keys must be in the [`EnvPolicy`].
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: GuardedPath) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Maps logical tool names to trusted executable paths configured at startup.
///
/// No `PATH` lookup ever happens at execution time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Allowlist {
    tools: BTreeMap<String, PathBuf>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` as running the executable at `path`.
    ///
    /// The path must be absolute so resolution cannot depend on the caller's
    /// working directory or `PATH`.
    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> GuardResult<()> {
        let name = name.into();
        let path = path.into();
        if name.is_empty() {
            return Err(GuardError::Config("allowlist tool name is empty".into()));
        }
        if !path.is_absolute() {
            return Err(GuardError::Config(format!(
                "allowlist entry '{name}' must be an absolute path, got '{}'",
                path.display()
            )));
        }
        self.tools.insert(name, path);
        Ok(())
    }

    pub fn with_tool(
        mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> GuardResult<Self> {
        self.insert(name, path)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.tools.get(name).map(PathBuf::as_path)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.tools.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// The set of environment variables a command may override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvPolicy {
    allowed: BTreeSet<String>,
}

impl EnvPolicy {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, key: &str) -> bool {
        self.allowed.contains(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

/// A command that passed [`CommandGuard::validate`].
///
/// Holds the resolved executable path; the fields are private so the only
/// way to build one is through the guard.
#[derive(Debug, Clone)]
pub struct ValidatedCommand {
    tool: String,
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<GuardedPath>,
    timeout: Option<Duration>,
    env: Vec<(String, String)>,
}

impl ValidatedCommand {
    /// The logical tool name (also the circuit breaker identity).
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&GuardedPath> {
        self.working_dir.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Build the process command. Each argument is passed as its own argv
    /// entry; no shell is involved.
    ///
    /// The child is killed if the returned command's child handle is dropped,
    /// so abandoning a run never leaks the process.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir.as_path());
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Validates [`CommandSpec`]s against an allowlist and an environment policy.
///
/// Holds only immutable configuration and is safe to share between threads.
#[derive(Debug, Clone, Default)]
pub struct CommandGuard {
    allowlist: Allowlist,
    env_policy: EnvPolicy,
}

impl CommandGuard {
    pub fn new(allowlist: Allowlist, env_policy: EnvPolicy) -> Self {
        Self {
            allowlist,
            env_policy,
        }
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn env_policy(&self) -> &EnvPolicy {
        &self.env_policy
    }

    pub fn validate(&self, spec: &CommandSpec) -> GuardResult<ValidatedCommand> {
        let reject = |reason: String| {
            tracing::warn!(tool = %spec.executable, %reason, "command rejected");
            GuardError::CommandRejected {
                executable: spec.executable.clone(),
                reason,
            }
        };

        if spec.executable.is_empty() {
            return Err(reject("empty command".to_string()));
        }

        let program = self
            .allowlist
            .get(&spec.executable)
            .ok_or_else(|| reject("executable is not in allowed list".to_string()))?;

        if let Some(index) = spec.args.iter().position(|a| a.contains('\0')) {
            return Err(reject(format!("argument {index} contains a NUL byte")));
        }

        let mut env = Vec::with_capacity(spec.env.len());
        for (key, value) in &spec.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(reject(format!("malformed environment key '{key}'")));
            }
            if value.contains('\0') {
                return Err(reject(format!("environment value for '{key}' contains a NUL byte")));
            }
            if !self.env_policy.allows(key) {
                return Err(reject(format!("environment override '{key}' is not permitted")));
            }
            env.push((key.clone(), value.clone()));
        }

        Ok(ValidatedCommand {
            tool: spec.executable.clone(),
            program: program.to_path_buf(),
            args: spec.args.clone(),
            working_dir: spec.working_dir.clone(),
            timeout: spec.timeout,
            env,
        })
    }
}
