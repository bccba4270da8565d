//! Bounded parallel executor
//!
//! Maps a policy function over a batch of items on a fixed pool of worker
//! threads:
//! - Items are pulled from a shared queue, so a slow item never stalls the rest
//! - Each item's output is kept in memory and flushed as one chunk when the
//!   item completes, in completion order
//! - A failing or panicking item is recorded and the batch carries on
//! - Per-item counts are merged through [`SharedCounters`]
//! - A cancelled token stops dispatch; items already running finish, and an
//!   item its policy reports as interrupted is left out of the report

mod process;

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheKey, CacheStore};
use crate::counter::{CounterError, CounterTotals, SharedCounters};
use crate::error::{RuntimeError, RuntimeResult};
use crate::progress::{NoProgress, ProgressSink};
use crate::signal::{CancelToken, EXIT_CODE_INTERRUPTED};

pub use process::{ChildRegistry, ProcessOutput, ProcessTask};

/// Exit status recorded for a policy that panicked
pub const PANIC_EXIT_STATUS: i32 = 101;

/// What a policy reports for one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub error_count: u64,
    pub warning_count: u64,
    pub output: String,
    pub exit_status: i32,
    /// Served from the cache rather than computed
    #[serde(skip)]
    pub cache_hit: bool,
    /// Cut short by cancellation; never counted or cached
    #[serde(skip)]
    pub interrupted: bool,
}

impl PolicyOutcome {
    /// Clean result with no errors or warnings
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            error_count: 0,
            warning_count: 0,
            output: output.into(),
            exit_status: 0,
            cache_hit: false,
            interrupted: false,
        }
    }

    /// Non-zero exit; counts as one error until told otherwise
    pub fn failure(exit_status: i32, output: impl Into<String>) -> Self {
        Self {
            error_count: 1,
            warning_count: 0,
            output: output.into(),
            exit_status: if exit_status == 0 { 1 } else { exit_status },
            cache_hit: false,
            interrupted: false,
        }
    }

    /// Item abandoned because the run is being cancelled
    pub fn interrupted(output: impl Into<String>) -> Self {
        Self {
            error_count: 0,
            warning_count: 0,
            output: output.into(),
            exit_status: EXIT_CODE_INTERRUPTED,
            cache_hit: false,
            interrupted: true,
        }
    }

    /// Outcome for a computation that returned an error
    pub fn from_error(err: &RuntimeError) -> Self {
        match err {
            RuntimeError::Interrupted { .. } => Self::interrupted(err.to_string()),
            other => Self::failure(1, format!("{other}\n")),
        }
    }

    pub fn with_errors(mut self, count: u64) -> Self {
        self.error_count = count;
        self
    }

    pub fn with_warnings(mut self, count: u64) -> Self {
        self.warning_count = count;
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }
}

/// One dispatched item
#[derive(Debug, Clone)]
pub struct WorkerJob {
    /// Position of the item in the input batch
    pub index: usize,
    /// Worker thread that ran it
    pub worker: usize,
    pub started_at: DateTime<Utc>,
}

/// One finished item
#[derive(Debug, Clone)]
pub struct CompletedItem {
    pub job: WorkerJob,
    pub outcome: PolicyOutcome,
    pub duration: Duration,
    pub panicked: bool,
}

/// Result of a batch
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Finished items in completion order
    pub completed: Vec<CompletedItem>,
    pub totals: CounterTotals,
    pub workers: usize,
}

impl RunReport {
    pub fn cache_hits(&self) -> usize {
        self.completed.iter().filter(|c| c.outcome.cache_hit).count()
    }

    pub fn failed(&self) -> usize {
        self.completed.iter().filter(|c| !c.outcome.is_success()).count()
    }
}

/// Destination for per-item output chunks
pub trait OutputSink: Send + Sync {
    fn write_chunk(&self, item: &CompletedItem) -> io::Result<()>;
}

/// Writes each chunk to stdout under one lock
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_chunk(&self, item: &CompletedItem) -> io::Result<()> {
        write_text(&mut io::stdout().lock(), &item.outcome.output)
    }
}

/// Writes each chunk to stderr, for callers that keep stdout machine-readable
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl OutputSink for StderrSink {
    fn write_chunk(&self, item: &CompletedItem) -> io::Result<()> {
        write_text(&mut io::stderr().lock(), &item.outcome.output)
    }
}

fn write_text(out: &mut impl Write, text: &str) -> io::Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    out.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Drops all output
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardOutput;

impl OutputSink for DiscardOutput {
    fn write_chunk(&self, _item: &CompletedItem) -> io::Result<()> {
        Ok(())
    }
}

enum WorkerMessage {
    Done(CompletedItem),
    CounterFailed(CounterError),
}

/// Runs a policy over a batch on a bounded thread pool
pub struct ParallelExecutor {
    counters: SharedCounters,
    progress: Arc<dyn ProgressSink>,
    output: Arc<dyn OutputSink>,
    cancel: CancelToken,
    label: String,
}

impl ParallelExecutor {
    pub fn new(counters: SharedCounters) -> Self {
        Self {
            counters,
            progress: Arc::new(NoProgress),
            output: Arc::new(DiscardOutput),
            cancel: CancelToken::new(),
            label: "items".to_string(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn counters(&self) -> &SharedCounters {
        &self.counters
    }

    /// Run `policy` over every item with at most `max_jobs` workers.
    ///
    /// Errors:
    /// - `InvalidArgument` when `max_jobs` is zero
    /// - `ResourceUnavailable` when the counters cannot be updated
    /// - `Interrupted` when cancelled before every item ran
    pub fn run<T, F>(&self, items: Vec<T>, policy: F, max_jobs: usize) -> RuntimeResult<RunReport>
    where
        T: Send,
        F: Fn(&T) -> PolicyOutcome + Sync,
    {
        if max_jobs == 0 {
            return Err(RuntimeError::InvalidArgument(
                "max_jobs must be at least 1".to_string(),
            ));
        }

        let total = items.len();
        if total == 0 {
            return Ok(RunReport {
                completed: Vec::new(),
                totals: self.counters.totals()?,
                workers: 0,
            });
        }

        let workers = max_jobs.min(total);
        info!(label = %self.label, items = total, workers, "starting batch");

        let queue = Mutex::new(items.into_iter().enumerate());
        let abort = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<WorkerMessage>();

        let mut completed = Vec::with_capacity(total);
        let mut counter_error = None;

        thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let abort = &abort;
                let policy = &policy;
                scope.spawn(move || self.worker_loop(worker, queue, policy, abort, tx));
            }
            drop(tx);

            for message in rx {
                match message {
                    WorkerMessage::Done(item) => {
                        if let Err(e) = self.output.write_chunk(&item) {
                            warn!(index = item.job.index, error = %e, "failed to write item output");
                        }
                        completed.push(item);
                        self.progress.report(completed.len(), total, &self.label);
                    }
                    WorkerMessage::CounterFailed(e) => {
                        if counter_error.is_none() {
                            counter_error = Some(e);
                        }
                    }
                }
            }
        });

        if let Some(e) = counter_error {
            return Err(match RuntimeError::from(e) {
                RuntimeError::Interrupted { .. } => RuntimeError::Interrupted {
                    completed: completed.len(),
                },
                other => other,
            });
        }

        if completed.len() < total && self.cancel.is_cancelled() {
            info!(completed = completed.len(), total, "batch interrupted");
            return Err(RuntimeError::Interrupted {
                completed: completed.len(),
            });
        }

        let totals = self.counters.totals()?;
        debug!(
            errors = totals.errors,
            warnings = totals.warnings,
            failures = totals.failures,
            "batch finished"
        );

        Ok(RunReport {
            completed,
            totals,
            workers,
        })
    }

    fn worker_loop<T, F, I>(
        &self,
        worker: usize,
        queue: &Mutex<I>,
        policy: &F,
        abort: &AtomicBool,
        tx: mpsc::Sender<WorkerMessage>,
    ) where
        I: Iterator<Item = (usize, T)>,
        F: Fn(&T) -> PolicyOutcome,
    {
        loop {
            if self.cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                break;
            }

            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
            let (index, item) = match next {
                Some(next) => next,
                None => break,
            };

            let job = WorkerJob {
                index,
                worker,
                started_at: Utc::now(),
            };
            let start = Instant::now();

            let (outcome, panicked) = match panic::catch_unwind(AssertUnwindSafe(|| policy(&item))) {
                Ok(outcome) => (outcome, false),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(index, worker, "policy panicked: {}", message);
                    (
                        PolicyOutcome::failure(PANIC_EXIT_STATUS, format!("policy panicked: {message}")),
                        true,
                    )
                }
            };

            if outcome.interrupted {
                debug!(index, worker, "item interrupted, not recorded");
                break;
            }

            if let Err(e) = self.counters.record(&outcome) {
                abort.store(true, Ordering::SeqCst);
                let _ = tx.send(WorkerMessage::CounterFailed(e));
                break;
            }

            let item = CompletedItem {
                job,
                outcome,
                duration: start.elapsed(),
                panicked,
            };
            if tx.send(WorkerMessage::Done(item)).is_err() {
                break;
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Serve an outcome from the cache, or compute and store it.
///
/// A computation that fails becomes a failed (or interrupted) outcome and is
/// not cached, so the next run retries it. A cache write that fails is logged and ignored.
pub fn cached_outcome<F>(cache: &CacheStore, key: &CacheKey, compute: F) -> PolicyOutcome
where
    F: FnOnce() -> RuntimeResult<PolicyOutcome>,
{
    if let Some(mut outcome) = cache.get_json::<PolicyOutcome>(key) {
        outcome.cache_hit = true;
        return outcome;
    }

    match compute() {
        Ok(outcome) if outcome.interrupted => outcome,
        Ok(outcome) => {
            match cache.put_json(key, &outcome) {
                Ok(()) => {}
                Err(CacheError::Closed) => debug!(key = %key, "cache closed, result not stored"),
                Err(e) => warn!(key = %key, error = %e, "failed to store cache entry"),
            }
            outcome
        }
        Err(e) => {
            debug!(key = %key, error = %e, "computation failed, not caching");
            PolicyOutcome::from_error(&e)
        }
    }
}
