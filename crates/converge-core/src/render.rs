//! Human-readable and JSON rendering of run reports.

use serde::{Deserialize, Serialize};

use crate::engine::{ApplyReport, Outcome, PlanReport, PlanState};
use crate::probe::FieldValue;
use crate::reporter::StatusReport;

/// Output style for reports on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
    /// One row per spec or per probe field, for spreadsheets.
    Csv,
}

/// Render any report as pretty JSON.
pub fn render_json<T: Serialize>(report: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

pub fn render_apply(report: &ApplyReport) -> String {
    let width = name_width(report.results.iter().map(|r| r.name.as_str()));
    let mut out = format!("Run ID: {}\n", report.run_id);
    out.push_str(&format!("Plan: {}\n\n", short(&report.plan_digest)));

    for result in &report.results {
        let marker = match result.outcome {
            Outcome::AlreadySatisfied | Outcome::Installed => "✓",
            Outcome::Failed { .. } => "✗",
            Outcome::SkippedDependencyFailed => "-",
        };
        let detail = match &result.outcome {
            Outcome::Failed { reason } => format!("failed: {reason}"),
            other => other.label().to_string(),
        };
        out.push_str(&format!(
            "  {marker} {:<width$}  {detail} ({}ms)\n",
            result.name, result.duration_ms
        ));
    }

    let converged = report.satisfied_count() + report.installed_count();
    out.push_str(&format!(
        "\nSummary: {}/{} converged ({} installed, {} already satisfied, {} failed, {} skipped) in {}ms\n",
        converged,
        report.results.len(),
        report.installed_count(),
        report.satisfied_count(),
        report.failed_count(),
        report.skipped_count(),
        report.duration_ms,
    ));
    if report.cancelled {
        out.push_str("Run was cancelled before completion\n");
    }
    out
}

pub fn render_plan(report: &PlanReport) -> String {
    let width = name_width(report.steps.iter().map(|s| s.name.as_str()));
    let mut out = format!("Plan: {}\n\n", short(&report.plan_digest));

    for step in &report.steps {
        let state = match &step.state {
            PlanState::Satisfied => "satisfied".to_string(),
            PlanState::Pending => "would install".to_string(),
            PlanState::Unknown { reason } => format!("unknown: {reason}"),
        };
        out.push_str(&format!("  {:<width$}  {state}", step.name));
        if !step.waits_on.is_empty() {
            out.push_str(&format!(" (after {})", step.waits_on.join(", ")));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "\n{} of {} specs would be installed\n",
        report.pending_count(),
        report.steps.len()
    ));
    out
}

/// One labelled section per probe, each a key/value table, in probe order.
pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();

    for probe in &report.probes {
        out.push_str(&format!("== {} ==\n", probe.name));
        let width = name_width(probe.fields.iter().map(|f| f.name.as_str()));
        for field in &probe.fields {
            out.push_str(&format!("  {:<width$}  {}\n", field.name, field.value.as_str()));
        }
        if let Some(error) = &probe.error {
            out.push_str(&format!("  ! {error}\n"));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "{} probes, {} unavailable (as of {})\n",
        report.probes.len(),
        report.unavailable_count(),
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
    ));
    out
}

/// `name,status,reason,duration_ms`, one row per spec in processing order.
pub fn render_apply_csv(report: &ApplyReport) -> csv::Result<String> {
    render_rows(
        &["name", "status", "reason", "duration_ms"],
        report.results.iter().map(|r| {
            let reason = match &r.outcome {
                Outcome::Failed { reason } => reason.clone(),
                _ => String::new(),
            };
            vec![
                r.name.clone(),
                r.outcome.label().to_string(),
                reason,
                r.duration_ms.to_string(),
            ]
        }),
    )
}

pub fn render_plan_csv(report: &PlanReport) -> csv::Result<String> {
    render_rows(
        &["name", "state", "reason", "waits_on"],
        report.steps.iter().map(|step| {
            let (state, reason) = match &step.state {
                PlanState::Satisfied => ("satisfied", String::new()),
                PlanState::Pending => ("pending", String::new()),
                PlanState::Unknown { reason } => ("unknown", reason.clone()),
            };
            vec![
                step.name.clone(),
                state.to_string(),
                reason,
                step.waits_on.join(";"),
            ]
        }),
    )
}

/// `probe,field,value,error`, one row per field. An unavailable field has an
/// empty value; the probe's error repeats on each of its rows.
pub fn render_status_csv(report: &StatusReport) -> csv::Result<String> {
    render_rows(
        &["probe", "field", "value", "error"],
        report.probes.iter().flat_map(|probe| {
            let error = probe.error.clone().unwrap_or_default();
            probe.fields.iter().map(move |field| {
                let value = match &field.value {
                    FieldValue::Value(v) => v.clone(),
                    FieldValue::Unavailable => String::new(),
                };
                vec![probe.name.clone(), field.name.clone(), value, error.clone()]
            })
        }),
    )
}

/// CSV with a header row.
pub fn render_rows(
    header: &[&str],
    rows: impl Iterator<Item = Vec<String>>,
) -> csv::Result<String> {
    let mut buf = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn name_width<'a>(names: impl Iterator<Item = &'a str>) -> usize {
    names.map(|n| n.chars().count()).max().unwrap_or(0)
}

fn short(digest: &str) -> &str {
    &digest[..12.min(digest.len())]
}
