//! converge core
//!
//! Declarative, idempotent provisioning for a single machine plus a
//! read-only status reporter:
//! - [`engine::ConvergenceEngine`] converges an ordered set of tool specs
//! - [`reporter::StatusReporter`] queries probes and renders their fields
//! - [`exec`] is the only way either of them touches the outside world

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod graph;
pub mod probe;
pub mod query;
pub mod render;
pub mod reporter;
pub mod spec;
pub mod telemetry;

// Re-export key types
pub use cancel::{CancelHandle, CancelSignal};
pub use config::Config;
pub use engine::{
    ApplyReport, ConvergenceEngine, ConvergenceResult, EngineConfig, Outcome, PlanReport,
    PlanState, PlanStep,
};
pub use error::{ConfigError, ExecError};
pub use exec::{run_bounded, CommandExecutor, CommandOutput, CommandSpec, ProcessExecutor};
pub use graph::DependencyGraph;
pub use probe::{FieldSpec, FieldValue, Probe, ProbeResult};
pub use query::OutputFormat;
pub use render::ReportFormat;
pub use reporter::{ReporterConfig, StatusReport, StatusReporter};
pub use spec::ToolSpec;
pub use telemetry::init_tracing;
