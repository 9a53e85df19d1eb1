//! converge - declarative workstation provisioning
//!
//! ## Commands
//!
//! - `apply`: converge every tool spec in the config
//! - `plan`: run checks only and show what `apply` would install
//! - `validate`: load the config and check the dependency graph
//! - `status`: query every probe and print a status report
//!
//! ## Exit codes
//!
//! `apply` exits 0 when every spec converged, 1 otherwise. Every command
//! exits 2 when the config cannot be loaded or is invalid.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use converge_core::render::{
    render_apply, render_apply_csv, render_json, render_plan, render_plan_csv, render_rows,
    render_status, render_status_csv,
};
use converge_core::{
    ApplyReport, CancelHandle, CancelSignal, Config, ConfigError, ConvergenceEngine,
    ProcessExecutor, ReportFormat, StatusReporter, ToolSpec,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

const EXIT_OK: u8 = 0;
const EXIT_NOT_CONVERGED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Idempotent workstation provisioning and status reporting", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Report format on stdout
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: Format,

    /// Write the report to this file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Cancel the run after this many seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring every tool spec to its installed state
    Apply {
        /// Path to converge.toml
        #[arg(short, long, env = "CONVERGE_CONFIG")]
        config: PathBuf,
    },

    /// Run checks only and report what apply would do
    Plan {
        /// Path to converge.toml
        #[arg(short, long, env = "CONVERGE_CONFIG")]
        config: PathBuf,
    },

    /// Validate the config without running anything
    Validate {
        /// Path to converge.toml
        #[arg(short, long, env = "CONVERGE_CONFIG")]
        config: PathBuf,
    },

    /// Query every probe and print their fields
    Status {
        /// Path to converge.toml
        #[arg(short, long, env = "CONVERGE_CONFIG")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Text,
    Json,
    Csv,
}

impl From<Format> for ReportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Text => ReportFormat::Text,
            Format::Json => ReportFormat::Json,
            Format::Csv => ReportFormat::Csv,
        }
    }
}

/// Where and how a report is emitted.
struct Sink {
    format: ReportFormat,
    output: Option<PathBuf>,
}

impl Sink {
    fn emit(&self, rendered: &str) -> Result<()> {
        match &self.output {
            Some(path) => {
                std::fs::write(path, rendered)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                info!(path = %path.display(), "report written");
            }
            None => print!("{rendered}"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    converge_core::init_tracing(cli.json, level);

    let sink = Sink {
        format: cli.format.into(),
        output: cli.output,
    };
    let cancel = spawn_canceller(cli.deadline_secs);

    let result = match cli.command {
        Commands::Apply { config } => cmd_apply(&config, &sink, &cancel).await,
        Commands::Plan { config } => cmd_plan(&config, &sink, &cancel).await,
        Commands::Validate { config } => cmd_validate(&config, &sink),
        Commands::Status { config } => cmd_status(&config, &sink, &cancel).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_NOT_CONVERGED)
        }
    }
}

/// Trip the cancellation signal on Ctrl-C or when the deadline passes.
fn spawn_canceller(deadline_secs: Option<u64>) -> CancelSignal {
    let (handle, signal) = CancelHandle::new();
    tokio::spawn(async move {
        let deadline = async {
            match deadline_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => warn!("interrupt received, cancelling"),
            _ = deadline => warn!(deadline_secs, "deadline reached, cancelling"),
        }
        handle.cancel();
    });
    signal
}

fn config_failure(path: &Path, err: &ConfigError) -> u8 {
    error!(config = %path.display(), error = %err, "invalid config");
    eprintln!("Error: {}: {err}", path.display());
    EXIT_CONFIG
}

fn load_tools(path: &Path) -> Result<(Config, Vec<ToolSpec>), ConfigError> {
    let config = Config::load(path)?;
    let specs = config.tool_specs()?;
    Ok((config, specs))
}

fn apply_exit_code(report: &ApplyReport) -> u8 {
    if report.all_converged() && !report.cancelled {
        EXIT_OK
    } else {
        EXIT_NOT_CONVERGED
    }
}

async fn cmd_apply(path: &Path, sink: &Sink, cancel: &CancelSignal) -> Result<u8> {
    let (config, specs) = match load_tools(path) {
        Ok(loaded) => loaded,
        Err(e) => return Ok(config_failure(path, &e)),
    };

    let engine = ConvergenceEngine::new(Arc::new(ProcessExecutor), config.engine_config());
    let report = match engine.apply(&specs, cancel).await {
        Ok(report) => report,
        Err(e) => return Ok(config_failure(path, &e)),
    };

    let rendered = match sink.format {
        ReportFormat::Text => render_apply(&report),
        ReportFormat::Json => render_json(&report).context("Failed to serialize apply report")?,
        ReportFormat::Csv => render_apply_csv(&report).context("Failed to write apply rows")?,
    };
    sink.emit(&rendered)?;
    Ok(apply_exit_code(&report))
}

async fn cmd_plan(path: &Path, sink: &Sink, cancel: &CancelSignal) -> Result<u8> {
    let (config, specs) = match load_tools(path) {
        Ok(loaded) => loaded,
        Err(e) => return Ok(config_failure(path, &e)),
    };

    let engine = ConvergenceEngine::new(Arc::new(ProcessExecutor), config.engine_config());
    let report = match engine.plan(&specs, cancel).await {
        Ok(report) => report,
        Err(e) => return Ok(config_failure(path, &e)),
    };

    let rendered = match sink.format {
        ReportFormat::Text => render_plan(&report),
        ReportFormat::Json => render_json(&report).context("Failed to serialize plan")?,
        ReportFormat::Csv => render_plan_csv(&report).context("Failed to write plan rows")?,
    };
    sink.emit(&rendered)?;
    Ok(EXIT_OK)
}

fn cmd_validate(path: &Path, sink: &Sink) -> Result<u8> {
    let checked = Config::load(path).and_then(|config| {
        let (specs, order) = config.tool_plan()?;
        let probes = config.probes()?;
        Ok((specs, probes, order))
    });
    let (specs, probes, order) = match checked {
        Ok(checked) => checked,
        Err(e) => return Ok(config_failure(path, &e)),
    };

    let order: Vec<&str> = order.iter().map(|&i| specs[i].name.as_str()).collect();
    let rendered = match sink.format {
        ReportFormat::Text => format!(
            "Config OK: {} tools, {} probes\nOrder: {}\n",
            specs.len(),
            probes.len(),
            order.join(" -> ")
        ),
        ReportFormat::Json => {
            let summary = json!({
                "valid": true,
                "tools": specs.len(),
                "probes": probes.len(),
                "order": order,
            });
            render_json(&summary).context("Failed to serialize validation summary")?
        }
        ReportFormat::Csv => render_rows(
            &["position", "name"],
            order
                .iter()
                .enumerate()
                .map(|(i, name)| vec![(i + 1).to_string(), name.to_string()]),
        )
        .context("Failed to write validation rows")?,
    };
    sink.emit(&rendered)?;
    Ok(EXIT_OK)
}

async fn cmd_status(path: &Path, sink: &Sink, cancel: &CancelSignal) -> Result<u8> {
    let loaded = Config::load(path).and_then(|config| {
        let probes = config.probes()?;
        Ok((config, probes))
    });
    let (config, probes) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => return Ok(config_failure(path, &e)),
    };

    let reporter = StatusReporter::new(Arc::new(ProcessExecutor), config.reporter_config());
    let report = reporter.report(&probes, cancel).await;

    let rendered = match sink.format {
        ReportFormat::Text => render_status(&report),
        ReportFormat::Json => render_json(&report).context("Failed to serialize status report")?,
        ReportFormat::Csv => render_status_csv(&report).context("Failed to write status rows")?,
    };
    sink.emit(&rendered)?;
    Ok(EXIT_OK)
}
