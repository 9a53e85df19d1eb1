//! Declarative tool specs.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::exec::CommandSpec;

/// One unit of installable or configurable software.
///
/// `check` answers "already satisfied?" by exit code; `install` is never run
/// when it says yes. `verify`, when present, confirms a fresh install.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolSpec {
    /// Unique identifier.
    pub name: String,

    /// Specs that must converge first.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Exit code 0 means the tool is already in place.
    pub check: CommandSpec,

    /// Ordered install steps; the first failing step fails the spec.
    pub install: Vec<CommandSpec>,

    /// Post-install confirmation, distinct from `check`.
    #[serde(default)]
    pub verify: Option<CommandSpec>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, check: CommandSpec) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            check,
            install: Vec::new(),
            verify: None,
        }
    }

    pub fn install_step(mut self, step: CommandSpec) -> Self {
        self.install.push(step);
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn verify(mut self, verify: CommandSpec) -> Self {
        self.verify = Some(verify);
        self
    }

    /// Shape checks that do not need the rest of the spec list.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName { kind: "tool" });
        }
        let empty = |role| ConfigError::EmptyCommand {
            owner: self.name.clone(),
            role,
        };
        if self.check.program.trim().is_empty() {
            return Err(empty("check"));
        }
        if self.install.is_empty() || self.install.iter().any(|s| s.program.trim().is_empty()) {
            return Err(empty("install"));
        }
        if matches!(&self.verify, Some(v) if v.program.trim().is_empty()) {
            return Err(empty("verify"));
        }
        Ok(())
    }
}
