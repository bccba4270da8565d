//! Workflow validation policy
//!
//! Each (file, mode) pair is one item. The configured checker for the mode
//! runs with the file path appended; its exit status and output lines decide
//! the outcome. Results are cached per file content and checker command.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use flowkeeper_runtime::{
    cached_outcome, CacheStore, CancelToken, ChildRegistry, PolicyOutcome, ProcessTask,
    RuntimeError, RuntimeResult,
};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CheckerConfig;

/// What a checker looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Syntax,
    Security,
    Performance,
}

impl ValidationMode {
    pub const ALL: [ValidationMode; 3] = [
        ValidationMode::Syntax,
        ValidationMode::Security,
        ValidationMode::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMode::Syntax => "syntax",
            ValidationMode::Security => "security",
            ValidationMode::Performance => "performance",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "syntax" => Ok(ValidationMode::Syntax),
            "security" => Ok(ValidationMode::Security),
            "performance" => Ok(ValidationMode::Performance),
            other => Err(format!("unknown validation mode: {}", other)),
        }
    }
}

/// One unit of validation work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationItem {
    pub path: PathBuf,
    pub mode: ValidationMode,
}

/// Cross every file with every mode, file-major
pub fn plan(files: &[PathBuf], modes: &[ValidationMode]) -> Vec<ValidationItem> {
    files
        .iter()
        .flat_map(|path| {
            modes.iter().map(move |mode| ValidationItem {
                path: path.clone(),
                mode: *mode,
            })
        })
        .collect()
}

/// `error`/`warning` at line start, optionally after `path:line:col:`
fn diagnostic_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?:\S+:\d+:\d+:\s*)?(error|warning)\b").ok())
        .as_ref()
}

/// Count error and warning lines. A failing exit with no error lines
/// counts as one error.
pub fn count_diagnostics(exit_status: i32, text: &str) -> (u64, u64) {
    let mut errors = 0;
    let mut warnings = 0;
    for line in text.lines() {
        let Some(re) = diagnostic_line() else { break };
        if let Some(caps) = re.captures(line.trim_start()) {
            if caps[1].eq_ignore_ascii_case("error") {
                errors += 1;
            } else {
                warnings += 1;
            }
        }
    }
    if exit_status != 0 && errors == 0 {
        errors = 1;
    }
    (errors, warnings)
}

/// Runs checkers for validation items
pub struct Validator {
    checkers: CheckerConfig,
    cache: Option<Arc<CacheStore>>,
    cancel: CancelToken,
    children: Arc<ChildRegistry>,
}

impl Validator {
    pub fn new(checkers: CheckerConfig, cancel: CancelToken, children: Arc<ChildRegistry>) -> Self {
        Self {
            checkers,
            cache: None,
            cancel,
            children,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Checker argv for a mode; empty when unconfigured
    pub fn command_for(&self, mode: ValidationMode) -> &[String] {
        match mode {
            ValidationMode::Syntax => &self.checkers.syntax,
            ValidationMode::Security => &self.checkers.security,
            ValidationMode::Performance => &self.checkers.performance,
        }
    }

    pub fn is_configured(&self, mode: ValidationMode) -> bool {
        !self.command_for(mode).is_empty()
    }

    /// Cache context for a mode: the mode plus the exact checker command
    pub fn cache_context(&self, mode: ValidationMode) -> String {
        format!("validate:{}:{}", mode, self.command_for(mode).join(" "))
    }

    /// Policy entry point
    pub fn check(&self, item: &ValidationItem) -> PolicyOutcome {
        let Some(cache) = &self.cache else {
            return self.run_checker(item).unwrap_or_else(failed);
        };

        let context = self.cache_context(item.mode);
        match cache.key_for(&item.path, Some(&context)) {
            Ok(key) => cached_outcome(cache, &key, || self.run_checker(item)),
            Err(e) => {
                debug!(path = %item.path.display(), error = %e, "not cacheable, running directly");
                self.run_checker(item).unwrap_or_else(failed)
            }
        }
    }

    fn run_checker(&self, item: &ValidationItem) -> RuntimeResult<PolicyOutcome> {
        let argv = self.command_for(item.mode);
        let task = ProcessTask::from_argv(argv)
            .map_err(|_| {
                RuntimeError::InvalidArgument(format!("no {} checker configured", item.mode))
            })?
            .arg(item.path.to_string_lossy())
            .with_cancel(self.cancel.clone())
            .with_registry(Arc::clone(&self.children))
            .with_timeout(Duration::from_secs(self.checkers.timeout_seconds.max(1)));

        let output = task.run().map_err(|e| {
            RuntimeError::Transient(format!("cannot run {}: {}", task.display(), e))
        })?;

        if output.cancelled {
            return Err(RuntimeError::Interrupted { completed: 0 });
        }
        if output.timed_out {
            return Err(RuntimeError::Transient(format!(
                "{} timed out after {}s",
                task.display(),
                self.checkers.timeout_seconds
            )));
        }

        let exit_status = output.exit_code();
        let mut text = output.stdout;
        if !output.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&output.stderr);
        }

        let (errors, warnings) = count_diagnostics(exit_status, &text);
        let outcome = PolicyOutcome {
            error_count: errors,
            warning_count: warnings,
            output: render(&item.path, item.mode, &text),
            exit_status,
            cache_hit: false,
            interrupted: false,
        };
        Ok(outcome)
    }
}

fn failed(err: RuntimeError) -> PolicyOutcome {
    PolicyOutcome::from_error(&err)
}

fn render(path: &Path, mode: ValidationMode, text: &str) -> String {
    let mut out = format!("==> {} [{}]\n", path.display(), mode);
    out.push_str(text);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}
