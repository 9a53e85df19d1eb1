//! External command execution.
//!
//! Everything converge does to the machine, and everything it learns about
//! it, goes through a [`CommandExecutor`]. The engine and the reporter only
//! ever call [`run_bounded`], which layers the timeout and the global
//! cancellation signal over whichever executor is plugged in.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::{ExecError, ExecResult};

/// Default per-command timeout. Package installs can be slow.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// One external command invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Overrides the caller's default timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    /// Build from an argv vector; `None` when it is empty.
    pub fn from_argv(argv: Vec<String>) -> Option<Self> {
        let mut parts = argv.into_iter();
        let program = parts.next()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self::new(program, parts.collect()))
    }

    /// Run `line` through `shell -c`.
    pub fn shell(shell: &str, line: impl Into<String>) -> Self {
        Self::new(shell, vec!["-c".to_string(), line.into()])
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Space-joined program and arguments, for logs and fakes.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Timeout to apply given the caller's default.
    pub fn effective_timeout(&self, default_timeout: Duration) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout)
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs commands. Implement this to plug in the real process layer or a
/// test double.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` to completion. Must be cancel-safe: dropping the returned
    /// future terminates the command.
    async fn run(&self, cmd: &CommandSpec) -> ExecResult<CommandOutput>;
}

/// Spawns real child processes with `tokio::process`.
///
/// On unix every command leads its own process group, so a timeout or
/// cancellation takes down everything it started, not just the shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, cmd: &CommandSpec) -> ExecResult<CommandOutput> {
        let start = Instant::now();

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ExecError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        let mut group = GroupGuard::new(child.id());

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ExecError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;
        group.disarm();

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// SIGKILLs a child's process group if dropped before the child was reaped.
///
/// The child itself is killed and reaped by tokio (`kill_on_drop`); this
/// catches whatever it forked.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    debug!(pgid, "killing process group");
    // Negative pid addresses the whole group.
    unsafe {
        libc::kill(-(pgid as libc::pid_t), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Run `cmd` on `executor`, bounded by its timeout and by `cancel`.
///
/// Whichever fires first drops the in-flight execution, which terminates the
/// underlying process.
pub async fn run_bounded(
    executor: &dyn CommandExecutor,
    cmd: &CommandSpec,
    default_timeout: Duration,
    cancel: &CancelSignal,
) -> ExecResult<CommandOutput> {
    if cmd.program.trim().is_empty() {
        return Err(ExecError::EmptyCommand);
    }
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    let limit = cmd.effective_timeout(default_timeout);
    let mut cancel = cancel.clone();
    debug!(command = %cmd.command_line(), timeout_secs = limit.as_secs(), "running command");

    tokio::select! {
        res = tokio::time::timeout(limit, executor.run(cmd)) => match res {
            Ok(output) => output,
            Err(_) => {
                warn!(command = %cmd.command_line(), timeout_secs = limit.as_secs(), "command timed out");
                Err(ExecError::Timeout { secs: limit.as_secs() })
            }
        },
        _ = cancel.cancelled() => {
            warn!(command = %cmd.command_line(), "command cancelled");
            Err(ExecError::Cancelled)
        }
    }
}
