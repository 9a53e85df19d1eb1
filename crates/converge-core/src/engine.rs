//! Convergence engine.
//!
//! Brings the machine in line with an ordered list of [`ToolSpec`]s. Specs
//! run strictly one at a time in dependency order; a failure is contained to
//! the failing spec and everything downstream of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::{ConfigResult, ExecError};
use crate::exec::{run_bounded, CommandExecutor, CommandSpec, DEFAULT_TIMEOUT_SECS};
use crate::graph::DependencyGraph;
use crate::spec::ToolSpec;

/// Reason recorded when `verify` rejects a fresh install.
pub const VERIFY_FAILED: &str = "post-install verification failed";

/// Per-spec outcome of an `apply` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    AlreadySatisfied,
    Installed,
    Failed { reason: String },
    SkippedDependencyFailed,
}

impl Outcome {
    /// `already-satisfied` or `installed`.
    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::AlreadySatisfied | Outcome::Installed)
    }

    /// Whether dependents of a spec with this outcome must be skipped.
    pub fn blocks_dependents(&self) -> bool {
        !self.is_converged()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::AlreadySatisfied => "already-satisfied",
            Outcome::Installed => "installed",
            Outcome::Failed { .. } => "failed",
            Outcome::SkippedDependencyFailed => "skipped-dependency-failed",
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }
}

/// Outcome for one spec, in processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub duration_ms: u64,
}

/// Everything an `apply` run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub run_id: Uuid,

    /// SHA-256 over the ordered spec names and commands.
    pub plan_digest: String,

    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Whether the run was cut short by the cancellation signal.
    pub cancelled: bool,

    pub results: Vec<ConvergenceResult>,
}

impl ApplyReport {
    pub fn all_converged(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_converged())
    }

    pub fn get(&self, name: &str) -> Option<&ConvergenceResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn satisfied_count(&self) -> usize {
        self.count(|o| matches!(o, Outcome::AlreadySatisfied))
    }

    pub fn installed_count(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Installed))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, Outcome::SkippedDependencyFailed))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// State of one spec in a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum PlanState {
    /// `check` passed; `apply` would leave it alone.
    Satisfied,
    /// `check` failed; `apply` would install it.
    Pending,
    /// `check` could not be evaluated.
    Unknown { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,
    #[serde(flatten)]
    pub state: PlanState,
    /// Dependencies that are not yet satisfied.
    pub waits_on: Vec<String>,
}

/// Result of [`ConvergenceEngine::plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_digest: String,
    pub generated_at: DateTime<Utc>,
    pub steps: Vec<PlanStep>,
}

impl PlanReport {
    pub fn pending_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state == PlanState::Pending)
            .count()
    }

    pub fn is_converged(&self) -> bool {
        self.steps.iter().all(|s| s.state == PlanState::Satisfied)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Applied to every command without its own `timeout_secs`.
    pub default_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

pub struct ConvergenceEngine {
    executor: Arc<dyn CommandExecutor>,
    config: EngineConfig,
}

impl ConvergenceEngine {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    /// Converge `specs`.
    ///
    /// Configuration problems (duplicates, unknown dependencies, cycles,
    /// empty commands) are returned before any command runs. Everything else
    /// is recorded per spec in the report.
    #[instrument(skip_all, fields(specs = specs.len()))]
    pub async fn apply(
        &self,
        specs: &[ToolSpec],
        cancel: &CancelSignal,
    ) -> ConfigResult<ApplyReport> {
        let (graph, order) = preflight(specs)?;
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let plan_digest = plan_digest(specs, &order);

        info!(run_id = %run_id, plan = %&plan_digest[..12], "starting apply");

        let mut outcomes: Vec<Option<Outcome>> = vec![None; specs.len()];
        let mut results = Vec::with_capacity(specs.len());
        let mut cancelled = false;

        for idx in order {
            let spec = &specs[idx];
            let spec_start = Instant::now();

            cancelled = cancelled || cancel.is_cancelled();
            let blocked_by = graph
                .dependencies_of(idx)
                .iter()
                .find(|&&d| outcomes[d].as_ref().is_some_and(Outcome::blocks_dependents));

            let outcome = if cancelled {
                debug!(spec = %spec.name, "run cancelled, skipping");
                Outcome::SkippedDependencyFailed
            } else if let Some(&dep) = blocked_by {
                info!(spec = %spec.name, dependency = %graph.name(dep), "dependency did not converge, skipping");
                Outcome::SkippedDependencyFailed
            } else {
                let outcome = self.converge(spec, cancel).await;
                cancelled = cancel.is_cancelled();
                outcome
            };

            match &outcome {
                Outcome::Failed { reason } => {
                    warn!(spec = %spec.name, reason = %reason, "spec failed")
                }
                other => info!(spec = %spec.name, outcome = other.label(), "spec done"),
            }

            outcomes[idx] = Some(outcome.clone());
            results.push(ConvergenceResult {
                name: spec.name.clone(),
                outcome,
                duration_ms: spec_start.elapsed().as_millis() as u64,
            });
        }

        let report = ApplyReport {
            run_id,
            plan_digest,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            cancelled,
            results,
        };
        info!(
            run_id = %run_id,
            installed = report.installed_count(),
            satisfied = report.satisfied_count(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            "apply finished"
        );
        Ok(report)
    }

    /// Dry run: validate and order like [`apply`](Self::apply), run only the
    /// `check` commands.
    #[instrument(skip_all, fields(specs = specs.len()))]
    pub async fn plan(&self, specs: &[ToolSpec], cancel: &CancelSignal) -> ConfigResult<PlanReport> {
        let (graph, order) = preflight(specs)?;
        let plan_digest = plan_digest(specs, &order);
        let mut states: Vec<Option<PlanState>> = vec![None; specs.len()];
        let mut steps = Vec::with_capacity(specs.len());

        for idx in order {
            let spec = &specs[idx];
            let state = match self.is_satisfied(spec, cancel).await {
                Ok(true) => PlanState::Satisfied,
                Ok(false) => PlanState::Pending,
                Err(e) => PlanState::Unknown {
                    reason: e.to_string(),
                },
            };
            let waits_on = graph
                .dependencies_of(idx)
                .iter()
                .filter(|&&d| states[d] != Some(PlanState::Satisfied))
                .map(|&d| graph.name(d).to_string())
                .collect();

            states[idx] = Some(state.clone());
            steps.push(PlanStep {
                name: spec.name.clone(),
                state,
                waits_on,
            });
        }

        Ok(PlanReport {
            plan_digest,
            generated_at: Utc::now(),
            steps,
        })
    }

    async fn converge(&self, spec: &ToolSpec, cancel: &CancelSignal) -> Outcome {
        match self.is_satisfied(spec, cancel).await {
            Ok(true) => return Outcome::AlreadySatisfied,
            Ok(false) => {}
            Err(e) => return Outcome::failed(e.to_string()),
        }

        let steps = spec.install.len();
        for (n, step) in spec.install.iter().enumerate() {
            debug!(spec = %spec.name, step = n + 1, of = steps, "install step");
            match self.run(step, cancel).await {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    return Outcome::failed(format!(
                        "install step {} exited with code {}: {}",
                        n + 1,
                        out.exit_code,
                        out.diagnostic()
                    ))
                }
                Err(e) if e.is_interrupted() => return Outcome::failed(e.to_string()),
                Err(e) => return Outcome::failed(format!("install step {}: {e}", n + 1)),
            }
        }

        if let Some(verify) = &spec.verify {
            match self.run(verify, cancel).await {
                Ok(out) if out.success() => {}
                Err(e) if e.is_interrupted() => return Outcome::failed(e.to_string()),
                Ok(out) => {
                    debug!(spec = %spec.name, exit_code = out.exit_code, "verify rejected install");
                    return Outcome::failed(VERIFY_FAILED);
                }
                Err(e) => {
                    debug!(spec = %spec.name, error = %e, "verify could not run");
                    return Outcome::failed(VERIFY_FAILED);
                }
            }
        }

        Outcome::Installed
    }

    /// Run the spec's `check`. Only a timeout or cancellation is an error; a
    /// check that cannot even be spawned means "not satisfied".
    async fn is_satisfied(&self, spec: &ToolSpec, cancel: &CancelSignal) -> Result<bool, ExecError> {
        match self.run(&spec.check, cancel).await {
            Ok(out) => Ok(out.success()),
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                debug!(spec = %spec.name, error = %e, "check could not run, treating as unsatisfied");
                Ok(false)
            }
        }
    }

    async fn run(
        &self,
        cmd: &CommandSpec,
        cancel: &CancelSignal,
    ) -> Result<crate::exec::CommandOutput, ExecError> {
        run_bounded(
            self.executor.as_ref(),
            cmd,
            self.config.default_timeout,
            cancel,
        )
        .await
    }
}

fn preflight(specs: &[ToolSpec]) -> ConfigResult<(DependencyGraph, Vec<usize>)> {
    for spec in specs {
        spec.validate()?;
    }
    let graph = DependencyGraph::build(specs)?;
    let order = graph.topological_order()?;
    Ok((graph, order))
}

/// Deterministic digest of the ordered specs and their commands.
pub fn plan_digest(specs: &[ToolSpec], order: &[usize]) -> String {
    let mut hasher = Sha256::new();
    for &idx in order {
        let spec = &specs[idx];
        hasher.update(spec.name.as_bytes());
        hasher.update(b"\0");
        let commands = std::iter::once(&spec.check)
            .chain(spec.install.iter())
            .chain(spec.verify.iter());
        for cmd in commands {
            hasher.update(cmd.command_line().as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
