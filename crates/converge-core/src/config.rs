//! Configuration loading from converge.toml.
//!
//! ```toml
//! [defaults]
//! timeout_secs = 300
//! concurrency = 4
//!
//! [[tool]]
//! name = "docker"
//! depends_on = ["curl"]
//! check = ["docker", "--version"]
//! install = ["curl -fsSL https://get.docker.com | sh"]
//! verify = { argv = ["docker", "info"], timeout_secs = 30 }
//!
//! [[probe]]
//! name = "deployment"
//! query = ["aws", "deploy", "get-deployment", "--deployment-id", "d-123"]
//! fields = [{ name = "status", path = "deploymentInfo.status" }]
//! ```
//!
//! A command is an argv array, a string handed to `<shell> -c`, or a table
//! with `argv` or `shell` plus optional `env` and `timeout_secs`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::EngineConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::exec::{CommandSpec, DEFAULT_TIMEOUT_SECS};
use crate::graph::plan_order;
use crate::probe::{FieldSpec, Probe};
use crate::query::OutputFormat;
use crate::reporter::ReporterConfig;
use crate::spec::ToolSpec;

/// Top-level configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default, rename = "tool")]
    pub tools: Vec<ToolEntry>,

    #[serde(default, rename = "probe")]
    pub probes: Vec<ProbeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Probe worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Interpreter for string commands.
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
            shell: default_shell(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_concurrency() -> usize {
    4
}

fn default_shell() -> String {
    "sh".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandDef {
    Argv(Vec<String>),
    Shell(String),
    Table(CommandTable),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTable {
    pub argv: Option<Vec<String>>,
    pub shell: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolEntry {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub check: CommandDef,
    pub install: Vec<CommandDef>,
    pub verify: Option<CommandDef>,
    /// Default for this tool's commands.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeEntry {
    pub name: String,
    pub query: CommandDef,
    #[serde(default)]
    pub format: OutputFormat,
    pub fields: Vec<FieldDef>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FieldDef {
    Name(String),
    Table { name: String, path: Option<String> },
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml: &str) -> ConfigResult<Self> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Tool specs in declared order, fully validated (including the
    /// dependency graph).
    pub fn tool_specs(&self) -> ConfigResult<Vec<ToolSpec>> {
        self.tool_plan().map(|(specs, _)| specs)
    }

    /// Tool specs in declared order plus the indices in convergence order.
    pub fn tool_plan(&self) -> ConfigResult<(Vec<ToolSpec>, Vec<usize>)> {
        let specs = self
            .tools
            .iter()
            .map(|t| self.tool_spec(t))
            .collect::<ConfigResult<Vec<_>>>()?;
        let order = plan_order(&specs)?;
        Ok((specs, order))
    }

    /// Probes in declared order.
    pub fn probes(&self) -> ConfigResult<Vec<Probe>> {
        let mut seen = HashSet::new();
        let mut probes = Vec::with_capacity(self.probes.len());
        for entry in &self.probes {
            let probe = self.probe(entry)?;
            probe.validate()?;
            if !seen.insert(probe.name.clone()) {
                return Err(ConfigError::DuplicateProbe { name: probe.name });
            }
            probes.push(probe);
        }
        Ok(probes)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_timeout: Duration::from_secs(self.defaults.timeout_secs),
        }
    }

    pub fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            concurrency: self.defaults.concurrency.max(1),
            default_timeout: Duration::from_secs(self.defaults.timeout_secs),
        }
    }

    fn tool_spec(&self, entry: &ToolEntry) -> ConfigResult<ToolSpec> {
        let command = |def: &CommandDef, role| {
            self.command(def, &entry.name, role, entry.timeout_secs)
        };
        Ok(ToolSpec {
            name: entry.name.clone(),
            depends_on: entry.depends_on.clone(),
            check: command(&entry.check, "check")?,
            install: entry
                .install
                .iter()
                .map(|def| command(def, "install"))
                .collect::<ConfigResult<Vec<_>>>()?,
            verify: entry
                .verify
                .as_ref()
                .map(|def| command(def, "verify"))
                .transpose()?,
        })
    }

    fn probe(&self, entry: &ProbeEntry) -> ConfigResult<Probe> {
        let fields = entry
            .fields
            .iter()
            .map(|f| match f {
                FieldDef::Name(name) => FieldSpec::new(name.clone()),
                FieldDef::Table { name, path } => {
                    FieldSpec::at(name.clone(), path.clone().unwrap_or_else(|| name.clone()))
                }
            })
            .collect();
        Ok(Probe {
            name: entry.name.clone(),
            query: self.command(&entry.query, &entry.name, "query", entry.timeout_secs)?,
            format: entry.format,
            fields,
        })
    }

    fn command(
        &self,
        def: &CommandDef,
        owner: &str,
        role: &'static str,
        timeout_secs: Option<u64>,
    ) -> ConfigResult<CommandSpec> {
        let empty = || ConfigError::EmptyCommand {
            owner: owner.to_string(),
            role,
        };
        let shell = |line: &str| {
            if line.trim().is_empty() {
                Err(empty())
            } else {
                Ok(CommandSpec::shell(&self.defaults.shell, line))
            }
        };

        let cmd = match def {
            CommandDef::Argv(argv) => CommandSpec::from_argv(argv.clone()).ok_or_else(empty)?,
            CommandDef::Shell(line) => shell(line)?,
            CommandDef::Table(table) => {
                let cmd = match (&table.argv, &table.shell) {
                    (Some(argv), None) => {
                        CommandSpec::from_argv(argv.clone()).ok_or_else(empty)?
                    }
                    (None, Some(line)) => shell(line)?,
                    _ => {
                        return Err(ConfigError::Parse(format!(
                            "{owner}: {role} command needs exactly one of `argv` or `shell`"
                        )))
                    }
                };
                cmd.with_env(table.env.clone())
                    .with_timeout(table.timeout_secs.or(timeout_secs))
            }
        };

        Ok(match def {
            CommandDef::Table(_) => cmd,
            _ => cmd.with_timeout(timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKSTATION: &str = r#"
[defaults]
timeout_secs = 600

[[tool]]
name = "curl"
check = ["curl", "--version"]
install = [["sudo", "apt-get", "install", "-y", "curl"]]

[[tool]]
name = "nvm"
depends_on = ["curl"]
check = "test -s $HOME/.nvm/nvm.sh"
install = [
    "curl -o- https://raw.githubusercontent.com/nvm-sh/nvm/v0.39.7/install.sh | bash",
    { shell = ". $HOME/.nvm/nvm.sh && nvm install --lts", env = { NVM_DIR = "/home/dev/.nvm" } },
]
verify = { shell = ". $HOME/.nvm/nvm.sh && node --version", timeout_secs = 20 }
timeout_secs = 900

[[probe]]
name = "deployment"
query = ["aws", "deploy", "list-deployments", "--output", "json"]
fields = ["status", { name = "id", path = "deployments[0]" }]

[[probe]]
name = "vm"
query = "qm status 101 --verbose"
format = "key_value"
fields = ["status"]
"#;

    #[test]
    fn test_parse_workstation_config() {
        let config = Config::parse(WORKSTATION).expect("parse failed");
        assert_eq!(config.defaults.timeout_secs, 600);
        assert_eq!(config.defaults.concurrency, 4);
        assert_eq!(config.tools.len(), 2);
        assert_eq!(config.probes.len(), 2);
    }

    #[test]
    fn test_tool_specs_resolve_command_forms() {
        let config = Config::parse(WORKSTATION).unwrap();
        let specs = config.tool_specs().expect("specs invalid");

        let curl = &specs[0];
        assert_eq!(curl.check.program, "curl");
        assert_eq!(curl.install[0].command_line(), "sudo apt-get install -y curl");
        assert_eq!(curl.install[0].timeout_secs, None);

        let nvm = &specs[1];
        assert_eq!(nvm.depends_on, vec!["curl"]);
        assert_eq!(nvm.check.program, "sh");
        assert_eq!(nvm.check.args[0], "-c");
        assert_eq!(nvm.install.len(), 2);
        assert_eq!(nvm.install[0].timeout_secs, Some(900));
        assert_eq!(
            nvm.install[1].env.get("NVM_DIR").map(String::as_str),
            Some("/home/dev/.nvm")
        );
        let verify = nvm.verify.as_ref().expect("verify missing");
        assert_eq!(verify.timeout_secs, Some(20));
    }

    #[test]
    fn test_probes_resolve_fields_and_format() {
        let config = Config::parse(WORKSTATION).unwrap();
        let probes = config.probes().expect("probes invalid");
        assert_eq!(probes[0].fields[0], FieldSpec::new("status"));
        assert_eq!(probes[0].fields[1], FieldSpec::at("id", "deployments[0]"));
        assert_eq!(probes[0].format, OutputFormat::Json);
        assert_eq!(probes[1].format, OutputFormat::KeyValue);
        assert_eq!(probes[1].query.program, "sh");
    }

    #[test]
    fn test_cycle_is_config_error() {
        let config = Config::parse(
            r#"
[[tool]]
name = "x"
depends_on = ["y"]
check = ["true"]
install = [["true"]]

[[tool]]
name = "y"
depends_on = ["x"]
check = ["true"]
install = [["true"]]
"#,
        )
        .unwrap();
        assert!(matches!(
            config.tool_specs(),
            Err(ConfigError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_empty_argv_is_config_error() {
        let config = Config::parse(
            r#"
[[tool]]
name = "broken"
check = []
install = [["true"]]
"#,
        )
        .unwrap();
        assert!(matches!(
            config.tool_specs(),
            Err(ConfigError::EmptyCommand { role: "check", .. })
        ));
    }

    #[test]
    fn test_table_with_argv_and_shell_rejected() {
        let config = Config::parse(
            r#"
[[tool]]
name = "ambiguous"
check = { argv = ["true"], shell = "true" }
install = [["true"]]
"#,
        )
        .unwrap();
        assert!(matches!(config.tool_specs(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_duplicate_probe_rejected() {
        let config = Config::parse(
            r#"
[[probe]]
name = "alarms"
query = ["true"]
fields = ["state"]

[[probe]]
name = "alarms"
query = ["true"]
fields = ["state"]
"#,
        )
        .unwrap();
        assert!(matches!(
            config.probes(),
            Err(ConfigError::DuplicateProbe { .. })
        ));
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        assert!(matches!(
            Config::parse("[[tool]]\nname = \"git\"\nchek = [\"git\"]\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = Config::parse("").unwrap();
        assert!(config.tool_specs().unwrap().is_empty());
        assert!(config.probes().unwrap().is_empty());
        assert_eq!(config.engine_config().default_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            Config::load("/definitely/not/here/converge.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_tool_plan_orders_dependencies_first() {
        let config = Config::parse(
            r#"
[[tool]]
name = "nvm"
depends_on = ["curl"]
check = ["nvm"]
install = ["install-nvm"]

[[tool]]
name = "curl"
check = ["curl", "--version"]
install = [["apt-get", "install", "-y", "curl"]]
"#,
        )
        .unwrap();
        let (specs, order) = config.tool_plan().unwrap();
        let names: Vec<&str> = order.iter().map(|&i| specs[i].name.as_str()).collect();
        assert_eq!(names, vec!["curl", "nvm"]);
    }

    #[test]
    fn test_table_format_parses() {
        let config = Config::parse(
            r#"
[[probe]]
name = "containers"
query = ["pct", "list"]
format = "table"
fields = [{ name = "status", path = "[0].Status" }]
"#,
        )
        .unwrap();
        let probes = config.probes().unwrap();
        assert_eq!(probes[0].format, OutputFormat::Table);
        assert_eq!(probes[0].fields[0].path, "[0].Status");
    }
}
