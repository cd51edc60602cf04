//! Execution contexts and command execution.

use std::fmt;

use async_trait::async_trait;
use ptm_common::{PtmError, PtmResult};
use serde::{Deserialize, Serialize};

/// Where an operation runs: the base OS or a named network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecContext {
    /// The root network namespace.
    Root,
    /// A named network namespace (`ip netns`).
    Netns(String),
}

impl ExecContext {
    /// Namespace name, if any.
    #[must_use]
    pub fn netns(&self) -> Option<&str> {
        match self {
            Self::Root => None,
            Self::Netns(name) => Some(name),
        }
    }

    /// True for the root context.
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// Prefix `argv` so that it runs inside this context.
    #[must_use]
    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        match self {
            Self::Root => argv.to_vec(),
            Self::Netns(ns) => ["ip", "netns", "exec", ns.as_str()]
                .iter()
                .map(ToString::to_string)
                .chain(argv.iter().cloned())
                .collect(),
        }
    }
}

impl fmt::Display for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Netns(name) => write!(f, "netns:{name}"),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 when terminated by a signal.
    pub code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful, silent result.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A successful result with the given stdout.
    #[must_use]
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// True when the exit code is zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit into [`PtmError::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the command did not succeed.
    pub fn check(self, command: &[String]) -> PtmResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(PtmError::CommandFailed {
                command: command.join(" "),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs a command line inside an execution context.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run `argv` in `ctx` and capture its output. A non-zero exit is not
    /// an error at this level.
    async fn run(&self, ctx: &ExecContext, argv: &[String]) -> PtmResult<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, ctx: &ExecContext, argv: &[String]) -> PtmResult<CommandOutput> {
        let argv = ctx.wrap(argv);
        let (program, args) = argv.split_first().ok_or_else(|| PtmError::ArgumentMismatch {
            message: "empty command line".to_string(),
        })?;

        tracing::trace!(%ctx, command = %argv.join(" "), "Running command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an owned argv from string slices.
#[must_use]
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}
