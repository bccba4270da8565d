//! flowkeeper CLI
//!
//! Entry point for the `flowkeeper` command-line tool.

use std::path::PathBuf;
use std::process;

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flowkeeper::cleanup::{cutoff_for, select_stale, RunCleaner};
use flowkeeper::config::{deep_merge, host_config_path, nested, REPO_CONFIG_FILE};
use flowkeeper::logging::init_logging;
use flowkeeper::validate::plan;
use flowkeeper::{
    aggregate, discover, AnalyticsFilter, EffectiveConfig, ExitCode, Invocation,
    InvocationOptions, RemoteClient, RunHistory, RunSummary, ToolkitConfig, ValidationMode,
    Validator,
};
use flowkeeper_runtime::{CacheStore, ResourceMonitor, RuntimeError};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "flowkeeper")]
#[command(about = "Maintenance toolkit for CI/CD workflows", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to repo config file (default: .flowkeeper.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Cache directory override
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// State directory override (lock and counter files)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate workflow files with the configured checkers
    Validate {
        /// Files or directories (default: .github/workflows)
        paths: Vec<PathBuf>,

        /// Which checkers to run
        #[arg(long, value_enum, default_value = "all")]
        mode: ModeArg,

        /// Requested parallelism, reduced under host load
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Ignore cached results
        #[arg(long)]
        no_cache: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete completed runs older than a cutoff
    Cleanup {
        /// Age in days beyond which completed runs are deleted
        #[arg(long)]
        older_than_days: u32,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Requested parallelism, reduced under host load
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Aggregate recorded runs by outcome, command and workflow
    Analytics {
        /// Only runs from the last N days
        #[arg(long)]
        days: Option<u32>,

        /// Only runs of this command (validate, cleanup)
        #[arg(long)]
        command: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Inspect or maintain the result cache
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Show host load and the worker count it allows
    Resources {
        /// Requested parallelism (default: max_parallel_jobs)
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Entry counts and sizes
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Delete entries older than an age
    Prune {
        /// Maximum age in seconds (default: cache_prune_age_seconds)
        #[arg(long)]
        max_age_seconds: Option<u64>,
    },

    /// Delete every entry
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration and its sources
    Show {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Syntax,
    Security,
    Performance,
    All,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    match cli.command {
        Commands::Validate {
            paths,
            mode,
            jobs,
            no_cache,
            json,
        } => run_validate(&cli.global, &paths, mode, jobs, no_cache, json),
        Commands::Cleanup {
            older_than_days,
            dry_run,
            jobs,
            json,
        } => run_cleanup(&cli.global, older_than_days, dry_run, jobs, json),
        Commands::Analytics {
            days,
            command,
            json,
        } => run_analytics(&cli.global, days, command, json),
        Commands::Cache { action } => match action {
            CacheCommands::Stats { json } => run_cache_stats(&cli.global, json),
            CacheCommands::Prune { max_age_seconds } => run_cache_prune(&cli.global, max_age_seconds),
            CacheCommands::Clear => run_cache_clear(&cli.global),
        },
        Commands::Resources { jobs, json } => run_resources(&cli.global, jobs, json),
        Commands::Config { action } => match action {
            ConfigCommands::Show { json } => run_config_show(&cli.global, json),
        },
    }
}

/// Print an error and exit with a stable code
fn fail(code: ExitCode, message: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", message);
    process::exit(code.as_i32());
}

fn fail_runtime(err: RuntimeError) -> ! {
    fail(ExitCode::for_error_kind(err.kind()), err)
}

fn load_effective(global: &GlobalArgs) -> EffectiveConfig {
    let repo_path = match &global.config {
        Some(path) if !path.exists() => fail(
            ExitCode::Framework,
            format!("config file not found: {}", path.display()),
        ),
        Some(path) => path.clone(),
        None => PathBuf::from(REPO_CONFIG_FILE),
    };

    let mut overrides = Value::Null;
    if let Some(dir) = &global.cache_dir {
        overrides = deep_merge(overrides, nested("storage.cache_dir", json!(dir.to_string_lossy())));
    }
    if let Some(dir) = &global.state_dir {
        overrides = deep_merge(overrides, nested("storage.state_dir", json!(dir.to_string_lossy())));
    }
    let overrides = (!overrides.is_null()).then_some(overrides);

    let host = host_config_path();
    match EffectiveConfig::build(host.as_deref(), Some(&repo_path), overrides) {
        Ok(effective) => effective,
        Err(e) => fail(ExitCode::Framework, e),
    }
}

fn load_config(global: &GlobalArgs) -> ToolkitConfig {
    match load_effective(global).toolkit() {
        Ok(config) => config,
        Err(e) => fail(ExitCode::Framework, e),
    }
}

fn current_dir() -> PathBuf {
    match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => fail(ExitCode::Framework, format!("cannot read working directory: {}", e)),
    }
}

fn start_invocation(command: &str, config: ToolkitConfig, json: bool) -> Invocation {
    let options = InvocationOptions {
        install_signals: true,
        show_progress: !json,
        json_output: json,
    };
    match Invocation::start(command, config, &current_dir(), options) {
        Ok(invocation) => invocation,
        Err(e) => fail_runtime(e),
    }
}

/// Print the summary and exit with its code
fn report(summary: &RunSummary, json: bool) -> ! {
    if json {
        match summary.to_json() {
            Ok(out) => println!("{}", out),
            Err(e) => fail(ExitCode::Framework, format!("serializing summary: {}", e)),
        }
    } else {
        println!("{}", summary.human_summary);
    }
    process::exit(summary.exit_code);
}

fn run_validate(
    global: &GlobalArgs,
    paths: &[PathBuf],
    mode: ModeArg,
    jobs: Option<usize>,
    no_cache: bool,
    json: bool,
) {
    let config = load_config(global);

    let files = match discover(paths, &config.discovery) {
        Ok(files) => files,
        Err(e) => fail(ExitCode::Framework, e),
    };

    let mut invocation = start_invocation("validate", config.clone(), json);
    let mut validator = Validator::new(
        config.checkers.clone(),
        invocation.cancel_token(),
        invocation.children().clone(),
    );
    if !no_cache {
        validator = validator.with_cache(invocation.cache().clone());
    }

    let modes: Vec<ValidationMode> = match mode {
        ModeArg::All => {
            let configured: Vec<_> = ValidationMode::ALL
                .into_iter()
                .filter(|m| validator.is_configured(*m))
                .collect();
            for skipped in ValidationMode::ALL.iter().filter(|m| !configured.contains(*m)) {
                warn!(mode = %skipped, "no checker configured, skipping");
            }
            configured
        }
        ModeArg::Syntax => vec![ValidationMode::Syntax],
        ModeArg::Security => vec![ValidationMode::Security],
        ModeArg::Performance => vec![ValidationMode::Performance],
    };
    if let Some(missing) = modes.iter().find(|m| !validator.is_configured(**m)) {
        invocation.finish();
        fail(
            ExitCode::Framework,
            format!("no checker configured for {} mode", missing),
        );
    }
    if files.is_empty() {
        warn!("no workflow files found");
    }

    let items = plan(&files, &modes);
    let total = items.len();
    let workflows: Vec<String> = items.iter().map(|item| workflow_label(&item.path)).collect();
    let workers = invocation.job_count(jobs);
    let executor = invocation.executor("validate", total);
    let result = executor.run(items, |item| validator.check(item), workers);

    let summary = invocation.summarize_by_workflow(&workflows, result);
    invocation.finish();
    match summary {
        Ok(summary) => report(&summary, json),
        Err(e) => fail_runtime(e),
    }
}

fn run_cleanup(global: &GlobalArgs, older_than_days: u32, dry_run: bool, jobs: Option<usize>, json: bool) {
    let config = load_config(global);
    let mut invocation = start_invocation("cleanup", config.clone(), json);
    let client = RemoteClient::for_signals(
        config.remote.clone(),
        invocation.limiter().clone(),
        invocation.signals(),
        invocation.children().clone(),
    );

    let runs = match client.list_runs() {
        Ok(runs) => runs,
        Err(e) => {
            invocation.finish();
            fail_runtime(RuntimeError::from(e));
        }
    };
    let listed = runs.len();
    let stale = select_stale(runs, cutoff_for(older_than_days, Utc::now()));
    info!(listed, stale = stale.len(), dry_run, "selected stale runs");

    let total = stale.len();
    let workflows: Vec<String> = stale
        .iter()
        .map(|run| run.workflow.clone().unwrap_or_else(|| "(unnamed)".to_string()))
        .collect();
    let workers = invocation.job_count(jobs);
    let cleaner = RunCleaner::new(&client, dry_run);
    let executor = invocation.executor("cleanup", total);
    let result = executor.run(stale, |run| cleaner.clean(run), workers);

    let summary = invocation.summarize_by_workflow(&workflows, result);
    invocation.finish();
    match summary {
        Ok(summary) => report(&summary, json),
        Err(e) => fail_runtime(e),
    }
}

/// Workflow files are grouped by file name
fn workflow_label(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn run_analytics(global: &GlobalArgs, days: Option<u32>, command: Option<String>, json: bool) {
    let config = load_config(global);
    let history = RunHistory::new(&config.storage.resolved_state_dir());
    let load = match history.load() {
        Ok(load) => load,
        Err(e) => fail(
            ExitCode::Framework,
            format!("cannot read run history in {}: {}", history.dir().display(), e),
        ),
    };

    let filter = AnalyticsFilter {
        since: days.map(|d| Utc::now() - ChronoDuration::days(i64::from(d))),
        command,
    };
    let mut usage = aggregate(&load.summaries, &filter);
    usage.skipped = load.skipped.len();

    if json {
        match serde_json::to_string_pretty(&usage) {
            Ok(out) => println!("{}", out),
            Err(e) => fail(ExitCode::Framework, e),
        }
    } else {
        print!("{}", usage.render());
    }
}

fn open_cache(global: &GlobalArgs) -> (ToolkitConfig, CacheStore) {
    let config = load_config(global);
    let dir = config.storage.resolved_cache_dir();
    match CacheStore::open(&dir, &current_dir(), config.framework.cache_ttl()) {
        Ok(cache) => (config, cache),
        Err(e) => fail_runtime(e.into()),
    }
}

fn run_cache_stats(global: &GlobalArgs, json: bool) {
    let (_, cache) = open_cache(global);
    let stats = match cache.stats() {
        Ok(stats) => stats,
        Err(e) => fail_runtime(e.into()),
    };

    if json {
        println!("{}", json!({"root": cache.root().to_string_lossy(), "stats": stats}));
    } else {
        println!("Cache: {}", cache.root().display());
        println!("  Entries: {}", stats.entries);
        println!("  Expired: {}", stats.expired);
        println!("  Size: {} bytes", stats.total_bytes);
        println!("  Temp files: {}", stats.temp_files);
    }
}

fn run_cache_prune(global: &GlobalArgs, max_age_seconds: Option<u64>) {
    let (config, cache) = open_cache(global);
    let max_age = max_age_seconds
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.framework.cache_prune_age());

    match cache.prune(max_age) {
        Ok(report) => {
            println!(
                "Pruned {} entries and {} orphaned temp files ({} bytes)",
                report.removed, report.orphan_temps_removed, report.bytes_reclaimed
            );
            for error in &report.errors {
                eprintln!("warning: {}", error);
            }
        }
        Err(e) => fail_runtime(e.into()),
    }
}

fn run_cache_clear(global: &GlobalArgs) {
    let (_, cache) = open_cache(global);
    match cache.clear() {
        Ok(removed) => println!("Removed {} files from {}", removed, cache.root().display()),
        Err(e) => fail_runtime(e.into()),
    }
}

fn run_resources(global: &GlobalArgs, jobs: Option<usize>, json: bool) {
    let config = load_config(global);
    let limits = config.framework.resource_limits();
    let monitor = ResourceMonitor::new(limits.clone());
    let sample = monitor.sample();
    let status = monitor.check_thresholds(&sample);
    let requested = jobs.unwrap_or(config.framework.max_parallel_jobs);
    let safe = monitor.safe_job_count_for(requested, &sample);

    if json {
        println!(
            "{}",
            json!({
                "sample": sample,
                "status": status.to_string(),
                "requested_jobs": requested,
                "safe_jobs": safe,
            })
        );
    } else {
        println!(
            "Memory: {:.1}% (limit {}%)",
            sample.mem_percent, limits.memory_limit_percent
        );
        println!("CPU: {:.1}% (limit {}%)", sample.cpu_percent, limits.cpu_limit_percent);
        println!("Cores: {}", sample.cores);
        println!("Status: {}", status);
        println!("Safe jobs: {} (requested {})", safe, requested);
    }
}

fn run_config_show(global: &GlobalArgs, json: bool) {
    let effective = load_effective(global);
    let (config, redactions) = effective.redacted();

    if json {
        let out = json!({
            "created_at": effective.created_at,
            "sources": effective.sources,
            "redactions": redactions,
            "config": config,
        });
        match serde_json::to_string_pretty(&out) {
            Ok(s) => println!("{}", s),
            Err(e) => fail(ExitCode::Framework, e),
        }
        return;
    }

    println!("Sources (lowest precedence first):");
    for source in &effective.sources {
        let origin = serde_json::to_value(&source.origin)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        match (&source.path, &source.digest) {
            (Some(path), Some(digest)) => {
                println!("  {:<8} {} (sha256 {})", origin, path, short_digest(digest))
            }
            _ => println!("  {}", origin),
        }
    }
    if !redactions.is_empty() {
        println!("Redacted: {}", redactions.join(", "));
    }
    println!();
    match serde_json::to_string_pretty(&config) {
        Ok(s) => println!("{}", s),
        Err(e) => fail(ExitCode::Framework, e),
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
