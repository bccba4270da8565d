//! Per-command wiring of the runtime components
//!
//! One [`Invocation`] exists per top-level command. It owns the run id, the
//! signal manager and every resource that needs cleaning up, and registers
//! those cleanups in a fixed order:
//! 1. terminate running child processes
//! 2. remove in-flight cache temp files
//! 3. remove counter files
//!
//! The first signal only cancels and terminates running children, so the
//! command can still summarize what finished. The registry drains on
//! [`Invocation::finish`], or from the handler on a second signal.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use flowkeeper_runtime::{
    CacheStore, CancelToken, ChildRegistry, FileCounter, OutputSink, ParallelExecutor,
    RateLimiter, ResourceMonitor, ResourceSample, RunReport, RuntimeError, RuntimeResult,
    SharedCounters, SignalManager, StderrSink, StdoutSink, ThresholdStatus,
};
use tracing::{debug, info, warn};

use crate::config::{CounterBackend, ToolkitConfig};
use crate::progress::BarProgress;
use crate::summary::{RunHistory, RunSummary};

/// How an invocation interacts with the process
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationOptions {
    /// Arm SIGINT/SIGTERM/SIGHUP handlers (once per process)
    pub install_signals: bool,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
    /// Item output goes to stderr so stdout carries only JSON
    pub json_output: bool,
}

/// Everything one top-level command needs
pub struct Invocation {
    run_id: String,
    command: String,
    config: ToolkitConfig,
    options: InvocationOptions,
    signals: Arc<SignalManager>,
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    monitor: ResourceMonitor,
    sample: ResourceSample,
    children: Arc<ChildRegistry>,
    counters: SharedCounters,
    file_counter: Option<FileCounter>,
    progress: Option<Arc<BarProgress>>,
    started: Instant,
}

impl Invocation {
    /// Set up the components for `command`. Paths handed to the cache must
    /// resolve inside `source_root`.
    pub fn start(
        command: &str,
        config: ToolkitConfig,
        source_root: &Path,
        options: InvocationOptions,
    ) -> RuntimeResult<Self> {
        let monitor = ResourceMonitor::new(config.framework.resource_limits());
        Self::start_with_monitor(command, config, source_root, options, monitor)
    }

    /// As [`Invocation::start`] with an explicit monitor
    pub fn start_with_monitor(
        command: &str,
        config: ToolkitConfig,
        source_root: &Path,
        options: InvocationOptions,
        monitor: ResourceMonitor,
    ) -> RuntimeResult<Self> {
        config
            .framework
            .validate()
            .map_err(|e| RuntimeError::InvalidArgument(e.to_string()))?;

        let run_id = ulid::Ulid::new().to_string();
        let signals = Arc::new(SignalManager::new());
        if options.install_signals {
            signals
                .install()
                .map_err(|e| RuntimeError::ResourceUnavailable(format!("signal handler: {}", e)))?;
        }

        let cache_dir = config.storage.resolved_cache_dir();
        let cache = Arc::new(CacheStore::open(
            &cache_dir,
            source_root,
            config.framework.cache_ttl(),
        )?);
        match cache.prune(config.framework.cache_prune_age()) {
            Ok(report) if report.removed + report.orphan_temps_removed > 0 => {
                debug!(
                    removed = report.removed,
                    orphan_temps = report.orphan_temps_removed,
                    "pruned cache"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache prune failed"),
        }

        let limiter = Arc::new(RateLimiter::new(config.framework.rate_limit()));
        let sample = monitor.sample();
        if let ThresholdStatus::Constrained(reason) = monitor.check_thresholds(&sample) {
            warn!(%reason, "host under load, reducing parallelism");
        }

        let children = Arc::new(ChildRegistry::new());
        let (counters, file_counter) = match config.storage.counter_backend {
            CounterBackend::Memory => (SharedCounters::in_memory(), None),
            CounterBackend::File => {
                let state_dir = config.storage.resolved_state_dir();
                let locks = state_dir.join("locks");
                fs::create_dir_all(&locks).map_err(|e| {
                    RuntimeError::ResourceUnavailable(format!("{}: {}", locks.display(), e))
                })?;
                let counter = FileCounter::for_run(
                    &state_dir,
                    command,
                    &run_id,
                    config.framework.lock_timeout(),
                );
                (SharedCounters::new(Arc::new(counter.clone())), Some(counter))
            }
        };

        let invocation = Self {
            run_id,
            command: command.to_string(),
            config,
            options,
            signals,
            cache,
            limiter,
            monitor,
            sample,
            children,
            counters,
            file_counter,
            progress: None,
            started: Instant::now(),
        };
        invocation.register_cleanups();

        info!(
            run_id = %invocation.run_id,
            command,
            cache = %cache_dir.display(),
            "invocation started"
        );
        Ok(invocation)
    }

    fn register_cleanups(&self) {
        let children = Arc::clone(&self.children);
        self.signals.on_interrupt("terminate children", move || {
            children.terminate_all();
        });

        let children = Arc::clone(&self.children);
        self.signals.register("terminate children", move || {
            children.terminate_all();
            Ok(())
        });

        let cache = Arc::clone(&self.cache);
        self.signals.register("cache temp files", move || {
            cache.close_and_cleanup();
            Ok(())
        });

        if let Some(counter) = self.file_counter.clone() {
            self.signals
                .register("counter files", move || counter.remove().map_err(Into::into));
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn children(&self) -> &Arc<ChildRegistry> {
        &self.children
    }

    pub fn signals(&self) -> &Arc<SignalManager> {
        &self.signals
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.signals.cancel_token()
    }

    pub fn counters(&self) -> &SharedCounters {
        &self.counters
    }

    pub fn file_counter(&self) -> Option<&FileCounter> {
        self.file_counter.as_ref()
    }

    pub fn sample(&self) -> &ResourceSample {
        &self.sample
    }

    /// Safe worker count for the requested (or configured) parallelism
    pub fn job_count(&self, requested: Option<usize>) -> usize {
        let requested = requested.unwrap_or(self.config.framework.max_parallel_jobs);
        self.monitor.safe_job_count_for(requested, &self.sample)
    }

    /// Executor wired to this invocation's counters, cancel token and output
    pub fn executor(&mut self, label: &str, total: usize) -> ParallelExecutor {
        let output: Arc<dyn OutputSink> = if self.options.json_output {
            Arc::new(StderrSink)
        } else {
            Arc::new(StdoutSink)
        };
        let mut executor = ParallelExecutor::new(self.counters.clone())
            .with_cancel(self.cancel_token())
            .with_output(output)
            .with_label(label);

        if self.options.show_progress && total > 0 {
            let bar = Arc::new(BarProgress::new(total, label));
            executor = executor.with_progress(bar.clone());
            self.progress = Some(bar);
        }
        executor
    }

    /// Turn a batch result into a summary and record it in the run history.
    ///
    /// An interrupted batch still yields a summary from the counters; other
    /// framework errors are returned.
    pub fn summarize(&self, items: usize, result: RuntimeResult<RunReport>) -> RuntimeResult<RunSummary> {
        self.summarize_inner(items, result, &[])
    }

    /// As [`Invocation::summarize`], also tallying items per workflow.
    /// `workflows[i]` names the workflow of batch item `i`.
    pub fn summarize_by_workflow(
        &self,
        workflows: &[String],
        result: RuntimeResult<RunReport>,
    ) -> RuntimeResult<RunSummary> {
        self.summarize_inner(workflows.len(), result, workflows)
    }

    fn summarize_inner(
        &self,
        items: usize,
        result: RuntimeResult<RunReport>,
        workflows: &[String],
    ) -> RuntimeResult<RunSummary> {
        if let Some(bar) = &self.progress {
            bar.finish();
        }

        let summary = RunSummary::new(self.run_id.clone(), &self.command, items);
        let summary = match result {
            Ok(report) => {
                let summary = summary.with_report(&report).with_workflows(&report, workflows);
                if self.signals.is_interrupted() {
                    summary.interrupted(report.completed.len())
                } else {
                    summary
                }
            }
            Err(RuntimeError::Interrupted { completed }) => {
                let totals = self.counters.totals().unwrap_or_default();
                summary.with_totals(totals).interrupted(completed)
            }
            Err(e) => return Err(e),
        };
        let summary = summary.with_duration_ms(self.started.elapsed().as_millis() as u64);
        self.record(&summary);
        Ok(summary)
    }

    /// Persist a summary; failures are logged, never fatal.
    fn record(&self, summary: &RunSummary) {
        let history = RunHistory::new(&self.config.storage.resolved_state_dir());
        if let Err(e) = history.record(summary) {
            warn!(run_id = %summary.run_id, error = %e, "failed to record run summary");
            return;
        }
        if let Err(e) = history.retain_last(self.config.storage.history_limit) {
            warn!(error = %e, "failed to trim run history");
        }
    }

    /// Drain the cleanup registry
    pub fn finish(self) {
        let report = self.signals.drain();
        info!(
            run_id = %self.run_id,
            cleanups = report.ran,
            failed = report.failed,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "invocation finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkeeper_runtime::resource::StaticSampler;
    use flowkeeper_runtime::{PolicyOutcome, ResourceLimits};
    use tempfile::TempDir;

    fn config(temp: &TempDir, backend: CounterBackend) -> ToolkitConfig {
        let mut config = ToolkitConfig::default();
        config.storage.cache_dir = Some(temp.path().join("cache"));
        config.storage.state_dir = Some(temp.path().join("state"));
        config.storage.counter_backend = backend;
        config
    }

    fn monitor(mem: f32, cpu: f32) -> ResourceMonitor {
        ResourceMonitor::with_sampler(
            ResourceLimits::default(),
            Box::new(StaticSampler(Some(ResourceSample {
                mem_percent: mem,
                cpu_percent: cpu,
                cores: 8,
            }))),
        )
    }

    fn start(temp: &TempDir, backend: CounterBackend, mem: f32) -> Invocation {
        Invocation::start_with_monitor(
            "validate",
            config(temp, backend),
            temp.path(),
            InvocationOptions::default(),
            monitor(mem, 10.0),
        )
        .unwrap()
    }

    #[test]
    fn test_job_count_follows_sample() {
        let temp = TempDir::new().unwrap();
        let idle = start(&temp, CounterBackend::Memory, 10.0);
        assert_eq!(idle.job_count(Some(16)), 16);
        assert_eq!(idle.job_count(None), 8);

        let busy = start(&temp, CounterBackend::Memory, 95.0);
        let jobs = busy.job_count(Some(16));
        assert!(jobs < 16 && jobs >= 1);
    }

    #[test]
    fn test_run_ids_are_unique() {
        let temp = TempDir::new().unwrap();
        let a = start(&temp, CounterBackend::Memory, 10.0);
        let b = start(&temp, CounterBackend::Memory, 10.0);
        assert_ne!(a.run_id(), b.run_id());
        assert_eq!(a.run_id().len(), 26);
    }

    #[test]
    fn test_invalid_framework_config() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp, CounterBackend::Memory);
        config.framework.min_parallel_jobs = 0;
        let err = Invocation::start_with_monitor(
            "validate",
            config,
            temp.path(),
            InvocationOptions::default(),
            monitor(10.0, 10.0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn test_file_counter_removed_on_finish() {
        let temp = TempDir::new().unwrap();
        let mut invocation = start(&temp, CounterBackend::File, 10.0);
        let executor = invocation.executor("validate", 4);

        let policy = |i: &i32| {
            if *i == 2 {
                PolicyOutcome::failure(1, "bad")
            } else {
                PolicyOutcome::success("ok").with_warnings(1)
            }
        };
        let report = executor.run(vec![0, 1, 2, 3], policy, 2).unwrap();
        let lock_path = invocation.file_counter().unwrap().lock_path().to_path_buf();
        assert!(lock_path.exists());

        let summary = invocation.summarize(4, Ok(report)).unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.warnings, 3);
        assert_eq!(summary.human_summary, "1 error, 3 warnings");

        invocation.finish();
        assert!(!lock_path.exists());
        let leftovers: Vec<_> = fs::read_dir(temp.path().join("state/locks"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_interrupted_batch_still_summarizes() {
        let temp = TempDir::new().unwrap();
        let invocation = start(&temp, CounterBackend::Memory, 10.0);
        invocation
            .counters()
            .record(&PolicyOutcome::success("").with_warnings(2))
            .unwrap();

        let summary = invocation
            .summarize(5, Err(RuntimeError::Interrupted { completed: 1 }))
            .unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.warnings, 2);
        assert_eq!(summary.exit_code, 130);
    }

    #[test]
    fn test_signal_after_last_item_still_marks_interrupted() {
        let temp = TempDir::new().unwrap();
        let mut invocation = start(&temp, CounterBackend::Memory, 10.0);
        let executor = invocation.executor("validate", 2);
        let report = executor
            .run(vec![0, 1], |_: &i32| PolicyOutcome::success("ok"), 1)
            .unwrap();

        invocation.signals().handle_signal();
        let summary = invocation.summarize(2, Ok(report)).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.exit_code, 130);
    }

    #[test]
    fn test_first_signal_terminates_children_and_defers_cleanup() {
        let temp = TempDir::new().unwrap();
        let invocation = start(&temp, CounterBackend::Memory, 10.0);
        let cache = Arc::clone(invocation.cache());

        invocation.signals().handle_signal();
        assert!(invocation.children().is_closed());
        assert!(invocation.cancel_token().is_cancelled());
        assert!(!cache.is_closed());

        invocation.finish();
        assert!(cache.is_closed());
    }

    #[test]
    fn test_summaries_are_recorded_per_workflow() {
        let temp = TempDir::new().unwrap();
        let mut invocation = start(&temp, CounterBackend::Memory, 10.0);
        let executor = invocation.executor("validate", 3);
        let report = executor
            .run(
                vec![0, 1, 2],
                |i: &i32| {
                    if *i == 1 {
                        PolicyOutcome::failure(1, "bad")
                    } else {
                        PolicyOutcome::success("ok")
                    }
                },
                2,
            )
            .unwrap();
        let workflows = vec!["ci.yml".to_string(), "ci.yml".to_string(), "nightly.yml".to_string()];

        let summary = invocation.summarize_by_workflow(&workflows, Ok(report)).unwrap();
        assert_eq!(summary.items, 3);
        assert_eq!(summary.workflows["ci.yml"].errors, 1);
        assert_eq!(summary.workflows["nightly.yml"].items, 1);

        let load = RunHistory::new(&temp.path().join("state")).load().unwrap();
        assert_eq!(load.summaries, vec![summary]);
    }

    #[test]
    fn test_cache_closed_after_finish() {
        let temp = TempDir::new().unwrap();
        let invocation = start(&temp, CounterBackend::Memory, 10.0);
        let cache = Arc::clone(invocation.cache());
        invocation.finish();
        assert!(cache.is_closed());
    }
}
