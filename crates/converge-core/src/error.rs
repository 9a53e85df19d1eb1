//! Error taxonomy for converge.
//!
//! [`ConfigError`] is fatal and raised before anything runs. [`ExecError`] is
//! contained to a single spec or probe and ends up in its recorded outcome.

use thiserror::Error;

/// Configuration problems. Always surfaced before any command executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("{kind} entry has an empty name")]
    EmptyName { kind: &'static str },

    #[error("duplicate tool spec name: {name}")]
    DuplicateName { name: String },

    #[error("duplicate probe name: {name}")]
    DuplicateProbe { name: String },

    #[error("spec {spec} depends on unknown spec {dependency}")]
    UnknownDependency { spec: String, dependency: String },

    #[error("dependency cycle detected involving specs: {specs:?}")]
    DependencyCycle { specs: Vec<String> },

    #[error("{owner} has an empty {role} command")]
    EmptyCommand { owner: String, role: &'static str },

    #[error("probe {probe} declares no fields")]
    NoFields { probe: String },
}

/// Failure of a single command execution or structured query.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout")]
    Timeout { secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("no data")]
    EmptyOutput,

    #[error("malformed output: {0}")]
    Malformed(String),
}

impl ExecError {
    /// Whether the command never got to report anything because it was
    /// stopped from the outside.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExecError::Timeout { .. } | ExecError::Cancelled)
    }
}

/// Result alias for configuration loading and validation.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result alias for command execution.
pub type ExecResult<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_specs() {
        let err = ConfigError::DependencyCycle {
            specs: vec!["x".to_string(), "y".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("x"));
        assert!(msg.contains("y"));
    }

    #[test]
    fn test_timeout_displays_as_plain_reason() {
        assert_eq!(ExecError::Timeout { secs: 5 }.to_string(), "timeout");
        assert!(ExecError::Timeout { secs: 5 }.is_interrupted());
        assert!(ExecError::Cancelled.is_interrupted());
        assert!(!ExecError::EmptyOutput.is_interrupted());
    }

    #[test]
    fn test_unknown_dependency_mentions_both_names() {
        let err = ConfigError::UnknownDependency {
            spec: "nvidia-driver".to_string(),
            dependency: "kernel-headers".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nvidia-driver"));
        assert!(msg.contains("kernel-headers"));
    }
}
