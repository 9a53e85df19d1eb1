//! Status reporter.
//!
//! [`StatusReporter`] fires every probe on a bounded pool and hands back one
//! [`ProbeResult`] per probe, in input order, no matter which finished first
//! or which failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelSignal;
use crate::error::ExecError;
use crate::exec::{CommandExecutor, DEFAULT_TIMEOUT_SECS};
use crate::probe::{Probe, ProbeResult};
use crate::query::query;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Maximum probes in flight at once.
    pub concurrency: usize,
    /// Applied to every query without its own `timeout_secs`.
    pub default_timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Results of one `status` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub probes: Vec<ProbeResult>,
}

impl StatusReport {
    pub fn get(&self, name: &str) -> Option<&ProbeResult> {
        self.probes.iter().find(|p| p.name == name)
    }

    /// Probes whose query failed.
    pub fn unavailable_count(&self) -> usize {
        self.probes.iter().filter(|p| !p.is_available()).count()
    }
}

pub struct StatusReporter {
    executor: Arc<dyn CommandExecutor>,
    config: ReporterConfig,
}

impl StatusReporter {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: ReporterConfig) -> Self {
        Self { executor, config }
    }

    /// Run every probe. Never fails as a whole: a probe that cannot be
    /// queried comes back with all fields `unavailable`.
    #[instrument(skip_all, fields(probes = probes.len()))]
    pub async fn report(&self, probes: &[Probe], cancel: &CancelSignal) -> StatusReport {
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (idx, probe) in probes.iter().cloned().enumerate() {
            let executor = Arc::clone(&self.executor);
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();
            let default_timeout = self.config.default_timeout;

            join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let result = run_probe(executor.as_ref(), &probe, default_timeout, &cancel).await;
                (idx, result)
            });
        }

        let mut slots: Vec<Option<ProbeResult>> = vec![None; probes.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(error = %e, "probe task join error"),
            }
        }

        let probes = probes
            .iter()
            .zip(slots)
            .map(|(probe, slot)| {
                slot.unwrap_or_else(|| ProbeResult::unavailable(probe, "probe task aborted"))
            })
            .collect::<Vec<_>>();

        let report = StatusReport {
            generated_at: Utc::now(),
            probes,
        };
        info!(
            probes = report.probes.len(),
            unavailable = report.unavailable_count(),
            "status collected"
        );
        report
    }
}

async fn run_probe(
    executor: &dyn CommandExecutor,
    probe: &Probe,
    default_timeout: Duration,
    cancel: &CancelSignal,
) -> ProbeResult {
    if cancel.is_cancelled() {
        return ProbeResult::unavailable(probe, ExecError::Cancelled.to_string());
    }

    debug!(probe = %probe.name, command = %probe.query.command_line(), "querying");
    match query(executor, &probe.query, probe.format, default_timeout, cancel).await {
        Ok(response) => ProbeResult::from_response(probe, &response),
        Err(e) => {
            warn!(probe = %probe.name, error = %e, "probe unavailable");
            ProbeResult::unavailable(probe, e.to_string())
        }
    }
}
