//! In-memory command executor (testing only)
//!
//! [`ScriptedExecutor`] answers commands from a table keyed by command line
//! and records every call, so tests can stand in for apt, docker, cloud CLIs
//! and friends without touching the machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{ExecError, ExecResult};
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec};

/// Scripted response to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// The program could not be started.
    SpawnFailure(String),
    /// Never completes; only a timeout or cancellation ends it.
    Hang,
}

impl Reply {
    pub fn ok() -> Self {
        Self::stdout("")
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

type Handler = Arc<dyn Fn(&CommandSpec) -> Reply + Send + Sync>;

/// Executor that replays scripted replies and records calls.
///
/// Unscripted commands exit 127 with "command not found".
#[derive(Default)]
pub struct ScriptedExecutor {
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `command_line` with `reply`.
    pub fn on(&self, command_line: &str, reply: Reply) -> &Self {
        self.on_with(command_line, move |_| reply.clone())
    }

    /// Answer `command_line` by calling `handler`.
    pub fn on_with(
        &self,
        command_line: &str,
        handler: impl Fn(&CommandSpec) -> Reply + Send + Sync + 'static,
    ) -> &Self {
        self.handlers
            .lock()
            .unwrap()
            .insert(command_line.to_string(), Arc::new(handler));
        self
    }

    /// Model something installable: `check_line` succeeds only after
    /// `install_line` has run once.
    pub fn installable(&self, check_line: &str, install_line: &str) -> &Self {
        let installed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&installed);
        self.on_with(check_line, move |_| {
            if seen.load(Ordering::SeqCst) {
                Reply::ok()
            } else {
                Reply::exit(1)
            }
        });
        self.on_with(install_line, move |_| {
            installed.store(true, Ordering::SeqCst);
            Reply::ok()
        })
    }

    /// Every command line run so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, command_line: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == command_line)
            .count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, cmd: &CommandSpec) -> ExecResult<CommandOutput> {
        let line = cmd.command_line();
        self.calls.lock().unwrap().push(line.clone());
        let handler = self.handlers.lock().unwrap().get(&line).cloned();

        let reply = match handler {
            Some(h) => h(cmd),
            None => Reply::fail(127, format!("{}: command not found", cmd.program)),
        };

        match reply {
            Reply::Exit {
                code,
                stdout,
                stderr,
            } => Ok(CommandOutput {
                exit_code: code,
                stdout,
                stderr,
                duration_ms: 0,
            }),
            Reply::SpawnFailure(msg) => Err(ExecError::Spawn {
                program: cmd.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, msg),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str) -> CommandSpec {
        let argv = line.split_whitespace().map(str::to_string).collect();
        CommandSpec::from_argv(argv).unwrap()
    }

    #[tokio::test]
    async fn test_unscripted_command_is_not_found() {
        let exec = ScriptedExecutor::new();
        let out = exec.run(&cmd("docker --version")).await.unwrap();
        assert_eq!(out.exit_code, 127);
        assert_eq!(exec.call_count("docker --version"), 1);
    }

    #[tokio::test]
    async fn test_installable_flips_after_install() {
        let exec = ScriptedExecutor::new();
        exec.installable("which git", "apt-get install git");

        assert!(!exec.run(&cmd("which git")).await.unwrap().success());
        assert!(exec.run(&cmd("apt-get install git")).await.unwrap().success());
        assert!(exec.run(&cmd("which git")).await.unwrap().success());
        assert_eq!(
            exec.calls(),
            vec!["which git", "apt-get install git", "which git"]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_maps_to_exec_error() {
        let exec = ScriptedExecutor::new();
        exec.on("nvidia-smi", Reply::SpawnFailure("no such file".to_string()));
        let err = exec.run(&cmd("nvidia-smi")).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
