//! Usage analytics over recorded runs
//!
//! Aggregates the summaries in the run history by outcome, by command and by
//! workflow. Nothing here talks to the remote platform.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::summary::RunSummary;

/// How a recorded run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Errors,
    Interrupted,
}

impl RunStatus {
    pub fn of(summary: &RunSummary) -> Self {
        if summary.interrupted {
            RunStatus::Interrupted
        } else if summary.exit_code != 0 {
            RunStatus::Errors
        } else {
            RunStatus::Success
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Errors => "errors",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

/// Which recorded runs to include
#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilter {
    /// Runs created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only this command
    pub command: Option<String>,
}

impl AnalyticsFilter {
    fn accepts(&self, summary: &RunSummary) -> bool {
        self.since.map_or(true, |since| summary.created_at >= since)
            && self.command.as_deref().map_or(true, |c| summary.command == c)
    }
}

/// Totals for one command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandStats {
    pub runs: usize,
    pub items: usize,
    pub completed: usize,
    pub errors: u64,
    pub warnings: u64,
    pub failures: u64,
    pub cache_hits: usize,
    pub interrupted: usize,
    pub total_duration_ms: u64,
    pub avg_duration_ms: u64,
}

/// Totals for one workflow across runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStats {
    /// Runs that touched the workflow
    pub runs: usize,
    pub items: usize,
    pub errors: u64,
    pub warnings: u64,
    pub failures: u64,
    /// Runs in which the workflow had at least one error
    pub failing_runs: usize,
}

/// Aggregated view of the run history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageReport {
    pub runs: usize,
    pub first_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub by_status: BTreeMap<RunStatus, usize>,
    pub by_command: BTreeMap<String, CommandStats>,
    pub by_workflow: BTreeMap<String, WorkflowStats>,
    /// Records that could not be read
    pub skipped: usize,
}

/// Fold the accepted summaries into a report.
pub fn aggregate(summaries: &[RunSummary], filter: &AnalyticsFilter) -> UsageReport {
    let mut report = UsageReport::default();

    for summary in summaries.iter().filter(|s| filter.accepts(s)) {
        report.runs += 1;
        report.first_run = Some(match report.first_run {
            Some(first) => first.min(summary.created_at),
            None => summary.created_at,
        });
        report.last_run = Some(match report.last_run {
            Some(last) => last.max(summary.created_at),
            None => summary.created_at,
        });
        *report.by_status.entry(RunStatus::of(summary)).or_default() += 1;

        let command = report.by_command.entry(summary.command.clone()).or_default();
        command.runs += 1;
        command.items += summary.items;
        command.completed += summary.completed;
        command.errors += summary.errors;
        command.warnings += summary.warnings;
        command.failures += summary.failures;
        command.cache_hits += summary.cache_hits;
        command.interrupted += usize::from(summary.interrupted);
        command.total_duration_ms = command.total_duration_ms.saturating_add(summary.duration_ms);

        for (name, tally) in &summary.workflows {
            let workflow = report.by_workflow.entry(name.clone()).or_default();
            workflow.runs += 1;
            workflow.items += tally.items;
            workflow.errors += tally.errors;
            workflow.warnings += tally.warnings;
            workflow.failures += tally.failures;
            if tally.errors > 0 {
                workflow.failing_runs += 1;
            }
        }
    }

    for stats in report.by_command.values_mut() {
        stats.avg_duration_ms = stats.total_duration_ms / stats.runs.max(1) as u64;
    }
    report
}

impl UsageReport {
    /// Plain-text rendering for the terminal
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.runs == 0 {
            out.push_str("No recorded runs.\n");
        } else {
            let _ = writeln!(out, "Runs: {}", self.runs);
            if let (Some(first), Some(last)) = (self.first_run, self.last_run) {
                let _ = writeln!(
                    out,
                    "Period: {} .. {}",
                    first.format("%Y-%m-%d %H:%M"),
                    last.format("%Y-%m-%d %H:%M")
                );
            }

            out.push_str("\nBy status:\n");
            for (status, count) in &self.by_status {
                let _ = writeln!(out, "  {:<12} {}", status.as_str(), count);
            }

            out.push_str("\nBy command:\n");
            for (name, stats) in &self.by_command {
                let _ = writeln!(
                    out,
                    "  {:<12} {} runs, {} items, {} errors, {} warnings, {} interrupted, avg {} ms",
                    name,
                    stats.runs,
                    stats.items,
                    stats.errors,
                    stats.warnings,
                    stats.interrupted,
                    stats.avg_duration_ms
                );
            }

            if !self.by_workflow.is_empty() {
                out.push_str("\nBy workflow:\n");
                for (name, stats) in &self.by_workflow {
                    let _ = writeln!(
                        out,
                        "  {:<24} {} runs, {} errors, {} warnings, failing in {} runs",
                        name, stats.runs, stats.errors, stats.warnings, stats.failing_runs
                    );
                }
            }
        }
        if self.skipped > 0 {
            let _ = writeln!(out, "\n{} unreadable records skipped", self.skipped);
        }
        out
    }
}
