//! Run summary for one top-level command

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use flowkeeper_runtime::{CounterTotals, RunReport};
use serde::{Deserialize, Serialize};

use super::failure::ExitCode;

/// Totals and outcome of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Invocation identifier (ULID)
    pub run_id: String,

    /// Command name, e.g. `validate`
    pub command: String,

    pub created_at: DateTime<Utc>,

    /// Items planned
    pub items: usize,

    /// Items that finished
    pub completed: usize,

    pub errors: u64,
    pub warnings: u64,

    /// Items with a non-zero exit status
    pub failures: u64,

    pub cache_hits: usize,

    pub duration_ms: u64,

    pub interrupted: bool,

    pub exit_code: i32,

    /// "N errors, M warnings"
    pub human_summary: String,

    /// Per-workflow totals for the items that finished
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, WorkflowTally>,
}

/// Totals for the items of one workflow within a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTally {
    pub items: usize,
    pub errors: u64,
    pub warnings: u64,
    pub failures: u64,
}

impl RunSummary {
    pub fn new(run_id: String, command: &str, items: usize) -> Self {
        let mut summary = Self {
            run_id,
            command: command.to_string(),
            created_at: Utc::now(),
            items,
            completed: 0,
            errors: 0,
            warnings: 0,
            failures: 0,
            cache_hits: 0,
            duration_ms: 0,
            interrupted: false,
            exit_code: ExitCode::Success.as_i32(),
            human_summary: String::new(),
            workflows: BTreeMap::new(),
        };
        summary.refresh();
        summary
    }

    /// Fill in from a finished batch
    pub fn with_report(mut self, report: &RunReport) -> Self {
        self.completed = report.completed.len();
        self.cache_hits = report.cache_hits();
        self.with_totals(report.totals)
    }

    /// Group finished items by workflow. `labels[i]` names the workflow of
    /// batch item `i`; items without a label are left out.
    pub fn with_workflows(mut self, report: &RunReport, labels: &[String]) -> Self {
        for item in &report.completed {
            let Some(label) = labels.get(item.job.index) else {
                continue;
            };
            let tally = self.workflows.entry(label.clone()).or_default();
            tally.items += 1;
            tally.errors += item.outcome.error_count;
            tally.warnings += item.outcome.warning_count;
            if !item.outcome.is_success() {
                tally.failures += 1;
            }
        }
        self
    }

    pub fn with_totals(mut self, totals: CounterTotals) -> Self {
        self.errors = totals.errors;
        self.warnings = totals.warnings;
        self.failures = totals.failures;
        self.refresh();
        self
    }

    /// Mark as interrupted after `completed` items
    pub fn interrupted(mut self, completed: usize) -> Self {
        self.interrupted = true;
        self.completed = completed;
        self.refresh();
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.interrupted {
            ExitCode::Interrupted
        } else if self.errors > 0 {
            ExitCode::ErrorsReported
        } else {
            ExitCode::Success
        }
    }

    fn refresh(&mut self) {
        self.exit_code = self.exit_code().as_i32();
        self.human_summary = Self::generate_human_summary(self.errors, self.warnings, self.interrupted);
    }

    fn generate_human_summary(errors: u64, warnings: u64, interrupted: bool) -> String {
        let plural = |n: u64, word: &str| {
            if n == 1 {
                format!("{} {}", n, word)
            } else {
                format!("{} {}s", n, word)
            }
        };
        let line = format!("{}, {}", plural(errors, "error"), plural(warnings, "warning"));
        if interrupted {
            format!("{} (interrupted)", line)
        } else {
            line
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
