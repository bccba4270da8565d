//! Remote platform client
//!
//! Talks to the CI platform by running configured command templates (the
//! `gh` CLI by default) and reading their stdout. Every call is admitted
//! through the shared [`RateLimiter`]; transient failures are retried with
//! exponential backoff and jitter. A quota command is polled periodically
//! and fed back into the limiter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowkeeper_runtime::{
    CancelToken, ChildRegistry, ProcessTask, RateLimiter, RuntimeError, SignalManager,
};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{RemoteConfig, RetryConfig};

/// Placeholder substituted with a run id in command templates
pub const ID_PLACEHOLDER: &str = "{id}";

/// Remote client errors
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote command not configured: {0}")]
    NotConfigured(&'static str),

    #[error("Remote call failed: {command}: {reason}")]
    Transient { command: String, reason: String },

    #[error("Unexpected remote output: {0}")]
    Parse(String),

    #[error("Remote call cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }
}

impl From<RemoteError> for RuntimeError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotConfigured(_) => RuntimeError::InvalidArgument(err.to_string()),
            RemoteError::Transient { .. } => RuntimeError::Transient(err.to_string()),
            RemoteError::Parse(_) => RuntimeError::ResourceUnavailable(err.to_string()),
            RemoteError::Cancelled => RuntimeError::Interrupted { completed: 0 },
        }
    }
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// One workflow run as reported by the list command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRun {
    #[serde(alias = "databaseId", deserialize_with = "id_as_string")]
    pub id: String,

    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub status: String,

    /// Name of the workflow the run belongs to, when the platform reports it
    #[serde(default, alias = "workflowName", skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

impl RemoteRun {
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }
}

/// Ids come back as numbers from some platforms and strings from others
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Replace the id placeholder in every argument
pub fn substitute_id(template: &[String], id: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(ID_PLACEHOLDER, id))
        .collect()
}

/// Exponential backoff for a 1-based retry attempt, capped at the max delay
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = retry.base_delay_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(retry.max_delay_ms))
}

/// Add up to half the delay again as random jitter
pub fn apply_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 2;
    if max_jitter == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    delay + Duration::from_millis(jitter)
}

/// Extract `remaining` or `rate.remaining` from quota output
pub fn parse_remaining(output: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(output.trim()).ok()?;
    value
        .get("remaining")
        .and_then(Value::as_u64)
        .or_else(|| value.get("rate")?.get("remaining")?.as_u64())
}

/// Client for the remote platform
pub struct RemoteClient {
    config: RemoteConfig,
    limiter: Arc<RateLimiter>,
    cancel: CancelToken,
    children: Arc<ChildRegistry>,
    calls: AtomicU32,
}

impl RemoteClient {
    pub fn new(
        config: RemoteConfig,
        limiter: Arc<RateLimiter>,
        cancel: CancelToken,
        children: Arc<ChildRegistry>,
    ) -> Self {
        Self {
            config,
            limiter,
            cancel,
            children,
            calls: AtomicU32::new(0),
        }
    }

    /// Client wired to a signal manager's cancel token
    pub fn for_signals(
        config: RemoteConfig,
        limiter: Arc<RateLimiter>,
        signals: &SignalManager,
        children: Arc<ChildRegistry>,
    ) -> Self {
        Self::new(config, limiter, signals.cancel_token(), children)
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// List runs
    pub fn list_runs(&self) -> RemoteResult<Vec<RemoteRun>> {
        if self.config.list.is_empty() {
            return Err(RemoteError::NotConfigured("list"));
        }
        let template = self.config.list.clone();
        let stdout = self.call(&template)?;
        serde_json::from_str(stdout.trim()).map_err(|e| RemoteError::Parse(e.to_string()))
    }

    /// Delete one run; returns the command's stdout
    pub fn delete_run(&self, id: &str) -> RemoteResult<String> {
        if self.config.delete.is_empty() {
            return Err(RemoteError::NotConfigured("delete"));
        }
        self.call(&substitute_id(&self.config.delete, id))
    }

    /// Query remaining quota and feed it to the limiter. Not rate limited.
    pub fn check_quota(&self) -> RemoteResult<Option<u64>> {
        if self.config.quota.is_empty() {
            return Ok(None);
        }
        let stdout = self.run_once(&self.config.quota)?;
        let remaining = parse_remaining(&stdout);
        match remaining {
            Some(remaining) => {
                if self.limiter.observe_remaining(remaining) {
                    warn!(remaining, "quota below low-water mark, slowing remote calls");
                }
            }
            None => debug!("quota output has no remaining count"),
        }
        Ok(remaining)
    }

    /// Run a command with admission, retry and periodic quota checks
    pub fn call(&self, argv: &[String]) -> RemoteResult<String> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }

            self.limiter.admit();
            self.maybe_check_quota();

            match self.run_once(argv) {
                Ok(stdout) => return Ok(stdout),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = apply_jitter(backoff_delay(&self.config.retry, attempt));
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "remote call failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn maybe_check_quota(&self) {
        let interval = self.config.quota_check_interval;
        if interval == 0 {
            return;
        }
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % interval == 0 {
            if let Err(e) = self.check_quota() {
                debug!(error = %e, "quota check failed");
            }
        }
    }

    fn run_once(&self, argv: &[String]) -> RemoteResult<String> {
        let task = ProcessTask::from_argv(argv)
            .map_err(|_| RemoteError::NotConfigured("command"))?
            .with_cancel(self.cancel.clone())
            .with_registry(Arc::clone(&self.children))
            .with_timeout(Duration::from_secs(self.config.timeout_seconds.max(1)));
        let command = task.display();
        debug!(command = %command, "remote call");

        let output = task.run().map_err(|e| RemoteError::Transient {
            command: command.clone(),
            reason: e.to_string(),
        })?;

        if output.cancelled {
            return Err(RemoteError::Cancelled);
        }
        if output.timed_out {
            return Err(RemoteError::Transient {
                command,
                reason: "timed out".to_string(),
            });
        }
        if !output.success() {
            let stderr = output.stderr.trim();
            return Err(RemoteError::Transient {
                command,
                reason: format!(
                    "exit {}{}",
                    output.exit_code(),
                    if stderr.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", stderr)
                    }
                ),
            });
        }
        Ok(output.stdout)
    }
}
