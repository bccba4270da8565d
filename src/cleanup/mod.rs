//! Run history cleanup policy
//!
//! Selects completed runs older than a cutoff and deletes each one through
//! the remote client. Every stale run is one executor item.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flowkeeper_runtime::PolicyOutcome;
use tracing::debug;

use crate::remote::{RemoteClient, RemoteError, RemoteRun};

/// Cutoff `days` before `now`
pub fn cutoff_for(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now - ChronoDuration::days(i64::from(days))
}

/// Completed runs created strictly before the cutoff, oldest first
pub fn select_stale(runs: Vec<RemoteRun>, cutoff: DateTime<Utc>) -> Vec<RemoteRun> {
    let mut stale: Vec<RemoteRun> = runs
        .into_iter()
        .filter(|run| run.is_completed() && run.created_at < cutoff)
        .collect();
    stale.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    stale
}

/// Deletes (or, in dry-run, reports) one stale run
pub struct RunCleaner<'a> {
    client: &'a RemoteClient,
    dry_run: bool,
}

impl<'a> RunCleaner<'a> {
    pub fn new(client: &'a RemoteClient, dry_run: bool) -> Self {
        Self { client, dry_run }
    }

    /// Policy entry point
    pub fn clean(&self, run: &RemoteRun) -> PolicyOutcome {
        let created = run.created_at.format("%Y-%m-%d %H:%M:%SZ");
        if self.dry_run {
            return PolicyOutcome::success(format!(
                "would delete run {} (created {})\n",
                run.id, created
            ))
            .with_warnings(1);
        }

        match self.client.delete_run(&run.id) {
            Ok(_) => {
                debug!(run_id = %run.id, "run deleted");
                PolicyOutcome::success(format!("deleted run {} (created {})\n", run.id, created))
            }
            Err(RemoteError::Cancelled) => {
                PolicyOutcome::interrupted(format!("cancelled before deleting run {}\n", run.id))
            }
            Err(e) => PolicyOutcome::failure(1, format!("failed to delete run {}: {}\n", run.id, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemoteConfig, RetryConfig};
    use chrono::TimeZone;
    use flowkeeper_runtime::{CancelToken, ChildRegistry, RateLimitConfig, RateLimiter};
    use std::sync::Arc;

    fn run(id: &str, days_ago: i64, status: &str, now: DateTime<Utc>) -> RemoteRun {
        RemoteRun {
            id: id.to_string(),
            created_at: now - ChronoDuration::days(days_ago),
            status: status.to_string(),
            workflow: None,
        }
    }

    fn client(delete: &[&str]) -> RemoteClient {
        client_with_cancel(delete, CancelToken::new())
    }

    fn client_with_cancel(delete: &[&str], cancel: CancelToken) -> RemoteClient {
        let config = RemoteConfig {
            delete: delete.iter().map(|s| s.to_string()).collect(),
            quota: Vec::new(),
            retry: RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            ..Default::default()
        };
        RemoteClient::new(
            config,
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            cancel,
            Arc::new(ChildRegistry::new()),
        )
    }

    #[test]
    fn test_select_stale() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let runs = vec![
            run("fresh", 2, "completed", now),
            run("old-b", 40, "completed", now),
            run("running", 90, "in_progress", now),
            run("old-a", 60, "completed", now),
        ];

        let stale = select_stale(runs, cutoff_for(30, now));
        let ids: Vec<&str> = stale.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old-a", "old-b"]);
    }

    #[test]
    fn test_cutoff_boundary_is_exclusive() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let stale = select_stale(vec![run("edge", 30, "completed", now)], cutoff_for(30, now));
        assert!(stale.is_empty());
    }

    #[test]
    fn test_dry_run_reports_warning() {
        let now = Utc::now();
        let client = client(&["false"]);
        let outcome = RunCleaner::new(&client, true).clean(&run("7", 50, "completed", now));
        assert!(outcome.is_success());
        assert_eq!(outcome.warning_count, 1);
        assert!(outcome.output.contains("would delete run 7"));
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_success_and_failure() {
        let now = Utc::now();

        let ok = client(&["true", "{id}"]);
        let outcome = RunCleaner::new(&ok, false).clean(&run("8", 50, "completed", now));
        assert!(outcome.is_success());
        assert_eq!(outcome.error_count, 0);

        let failing = client(&["false", "{id}"]);
        let outcome = RunCleaner::new(&failing, false).clean(&run("9", 50, "completed", now));
        assert_eq!(outcome.error_count, 1);
        assert!(outcome.output.contains("failed to delete run 9"));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancelled_delete_is_interrupted_not_an_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let client = client_with_cancel(&["true", "{id}"], cancel);

        let outcome = RunCleaner::new(&client, false).clean(&run("10", 50, "completed", Utc::now()));
        assert!(outcome.interrupted);
        assert_eq!(outcome.error_count, 0);
        assert!(outcome.output.contains("cancelled before deleting run 10"));
    }
}
