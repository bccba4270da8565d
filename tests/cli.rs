//! End-to-end tests for the flowkeeper binary
//!
//! Each test runs the binary inside its own temp directory with HOME pointed
//! there, so no host config or user cache leaks in.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let ws = Self {
            dir: TempDir::new().unwrap(),
        };
        fs::create_dir_all(ws.path().join(".github/workflows")).unwrap();
        ws
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    fn state_dir(&self) -> PathBuf {
        self.path().join("state")
    }

    fn workflow(&self, name: &str, body: &str) {
        fs::write(self.path().join(".github/workflows").join(name), body).unwrap();
    }

    #[cfg(unix)]
    fn script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Write `.flowkeeper.toml` with storage inside the workspace.
    fn config(&self, backend: &str, syntax: Option<&Path>) {
        self.config_with(backend, syntax, 60, "");
    }

    /// As `config`, with a checker timeout and extra TOML appended
    fn config_with(&self, backend: &str, syntax: Option<&Path>, timeout_seconds: u64, extra: &str) {
        let syntax = syntax
            .map(|p| format!("[{:?}]", p.display().to_string()))
            .unwrap_or_else(|| "[]".to_string());
        let toml = format!(
            "[storage]\ncounter_backend = \"{}\"\ncache_dir = {:?}\nstate_dir = {:?}\n\n\
             [checkers]\nsyntax = {}\nsecurity = []\nperformance = []\ntimeout_seconds = {}\n\n{}",
            backend,
            self.cache_dir().display().to_string(),
            self.state_dir().display().to_string(),
            syntax,
            timeout_seconds,
            extra,
        );
        fs::write(self.path().join(".flowkeeper.toml"), toml).unwrap();
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_flowkeeper"));
        cmd.args(args)
            .current_dir(self.path())
            .env("HOME", self.path())
            .env_remove("XDG_CACHE_HOME")
            .env_remove("XDG_STATE_HOME")
            .env_remove("RUST_LOG");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("failed to run flowkeeper")
    }
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}",
            e,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

/// Files left under `dir` whose names match `pred`, recursively
fn leftovers(dir: &Path, pred: &dyn Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(leftovers(&path, pred));
        } else if pred(&entry.file_name().to_string_lossy()) {
            found.push(path);
        }
    }
    found
}

// === config show ===

#[test]
fn test_config_show_json_lists_sources() {
    let ws = Workspace::new();
    ws.config("memory", None);

    let output = ws.run(&["config", "show", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json = stdout_json(&output);
    let origins: Vec<&str> = json["sources"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["origin"].as_str())
        .collect();
    assert_eq!(origins.first(), Some(&"builtin"));
    assert!(origins.contains(&"repo"));
    assert_eq!(json["config"]["storage"]["counter_backend"], "memory");
}

#[test]
fn test_missing_explicit_config_is_framework_error() {
    let ws = Workspace::new();
    let output = ws.run(&["-c", "nope.toml", "config", "show"]);
    assert_eq!(output.status.code(), Some(2));
}

// === validate ===

#[cfg(unix)]
#[test]
fn test_validate_clean_files_exit_zero() {
    let ws = Workspace::new();
    let checker = ws.script("lint.sh", "echo \"ok $1\"\nexit 0\n");
    ws.config("memory", Some(&checker));
    ws.workflow("ci.yml", "on: push\n");
    ws.workflow("release.yaml", "on: tag\n");

    let output = ws.run(&["validate", "--mode", "syntax", "--json"]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));

    let summary = stdout_json(&output);
    assert_eq!(summary["items"], 2);
    assert_eq!(summary["errors"], 0);
    assert_eq!(summary["exit_code"], 0);
}

#[cfg(unix)]
#[test]
fn test_validate_reports_checker_errors() {
    let ws = Workspace::new();
    let checker = ws.script(
        "lint.sh",
        "case \"$1\" in *broken*) echo \"error: bad key\"; exit 1;; esac\nexit 0\n",
    );
    ws.config("file", Some(&checker));
    ws.workflow("ci.yml", "on: push\n");
    ws.workflow("broken.yml", "on push\n");

    let output = ws.run(&["validate", "--mode", "syntax", "--json", "-j", "2"]);
    assert_eq!(output.status.code(), Some(1));

    let summary = stdout_json(&output);
    assert_eq!(summary["errors"], 1);
    assert_eq!(summary["completed"], 2);

    let counters = leftovers(&ws.state_dir(), &|name| {
        name.ends_with(".lock") || name.ends_with(".counter")
    });
    assert!(counters.is_empty(), "counter files left: {:?}", counters);
}

#[cfg(unix)]
#[test]
fn test_second_validate_is_served_from_cache() {
    let ws = Workspace::new();
    let calls = ws.path().join("calls.log");
    let checker = ws.script(
        "lint.sh",
        &format!("echo \"$1\" >> {:?}\nexit 0\n", calls.display().to_string()),
    );
    ws.config("memory", Some(&checker));
    ws.workflow("ci.yml", "on: push\n");

    for _ in 0..2 {
        let output = ws.run(&["validate", "--mode", "syntax", "--json"]);
        assert_eq!(output.status.code(), Some(0));
    }

    let logged = fs::read_to_string(&calls).unwrap();
    assert_eq!(logged.lines().count(), 1, "checker ran again: {}", logged);

    let output = ws.run(&["cache", "stats", "--json"]);
    assert_eq!(stdout_json(&output)["stats"]["entries"], 1);
}

#[cfg(unix)]
#[test]
fn test_unconfigured_mode_is_framework_error() {
    let ws = Workspace::new();
    ws.config("memory", None);
    ws.workflow("ci.yml", "on: push\n");

    let output = ws.run(&["validate", "--mode", "security"]);
    assert_eq!(output.status.code(), Some(2));
}

// === termination ===

/// Whether `pid` is still a live process (zombies count as gone)
#[cfg(unix)]
fn is_alive(pid: libc::pid_t) -> bool {
    if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The state letter follows the parenthesized command name
        return stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(true);
    }
    // SAFETY: signal 0 only checks that the pid exists
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Pids written to the marker files under `dir`
#[cfg(unix)]
fn marker_pids(dir: &Path) -> Vec<libc::pid_t> {
    let mut pids = Vec::new();
    for entry in fs::read_dir(dir).unwrap().flatten() {
        let text = fs::read_to_string(entry.path()).unwrap_or_default();
        pids.extend(text.lines().filter_map(|l| l.trim().parse::<libc::pid_t>().ok()));
    }
    pids
}

#[cfg(unix)]
#[test]
fn test_sigterm_cleans_up_and_exits_nonzero() {
    let ws = Workspace::new();
    let started = ws.path().join("started");
    fs::create_dir_all(&started).unwrap();
    // Each checker records its own pid and a background descendant's
    let checker = ws.script(
        "slow.sh",
        &format!(
            "marker={:?}/\"$(basename \"$1\")\"\nsleep 30 &\necho $$ > \"$marker.tmp\"\necho $! >> \"$marker.tmp\"\n\
             mv \"$marker.tmp\" \"$marker\"\nwait\n",
            started.display().to_string()
        ),
    );
    ws.config_with(
        "file",
        Some(&checker),
        60,
        "[framework]\nmin_parallel_jobs = 4\nmax_parallel_jobs = 4\n",
    );
    for i in 0..6 {
        ws.workflow(&format!("wf{}.yml", i), "on: push\n");
    }

    let child = ws
        .command(&["validate", "--mode", "syntax", "-j", "4"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn flowkeeper");

    let deadline = Instant::now() + Duration::from_secs(20);
    let markers = |dir: &Path| {
        fs::read_dir(dir)
            .map(|d| {
                d.flatten()
                    .filter(|e| !e.file_name().to_string_lossy().ends_with(".tmp"))
                    .count()
            })
            .unwrap_or(0)
    };
    while markers(&started) < 2 {
        assert!(Instant::now() < deadline, "fewer than two checkers started");
        std::thread::sleep(Duration::from_millis(50));
    }

    let pid = libc::pid_t::try_from(child.id()).unwrap();
    // SAFETY: plain kill(2) on a child we spawned and have not reaped
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    assert_eq!(rc, 0);

    let begun = Instant::now();
    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(130));
    assert!(
        begun.elapsed() < Duration::from_secs(20),
        "exit waited on sleeping checkers"
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let last = stdout.lines().last().unwrap_or_default();
    assert!(last.ends_with("(interrupted)"), "no summary line: {:?}", stdout);
    assert!(last.starts_with("0 errors"), "cancelled checkers counted: {:?}", last);

    let pids = marker_pids(&started);
    assert!(pids.len() >= 4, "markers incomplete: {:?}", pids);
    let settle = Instant::now() + Duration::from_secs(5);
    while pids.iter().any(|p| is_alive(*p)) && Instant::now() < settle {
        std::thread::sleep(Duration::from_millis(50));
    }
    let survivors: Vec<_> = pids.iter().filter(|p| is_alive(**p)).collect();
    assert!(survivors.is_empty(), "checker processes survived: {:?}", survivors);

    let counters = leftovers(&ws.state_dir().join("locks"), &|name| {
        name.ends_with(".lock") || name.ends_with(".counter") || name.ends_with(".tmp")
    });
    assert!(counters.is_empty(), "counter files left: {:?}", counters);

    let temps = leftovers(&ws.cache_dir().join("entries"), &|name| name.starts_with(".tmp-"));
    assert!(temps.is_empty(), "cache temp files left: {:?}", temps);
}

#[cfg(unix)]
#[test]
fn test_checker_descendant_holding_output_does_not_stall_run() {
    let ws = Workspace::new();
    let checker = ws.script("lint.sh", "sleep 30 &\necho \"ok $1\"\nexit 0\n");
    ws.config("memory", Some(&checker));
    ws.workflow("ci.yml", "on: push\n");

    let begun = Instant::now();
    let output = ws.run(&["validate", "--mode", "syntax", "--json", "--no-cache"]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(begun.elapsed() < Duration::from_secs(10), "run waited on the descendant");
    assert_eq!(stdout_json(&output)["errors"], 0);
}

#[cfg(unix)]
#[test]
fn test_checker_timeout_counts_as_error() {
    let ws = Workspace::new();
    let checker = ws.script("hang.sh", "sleep 30 &\nsleep 30\n");
    ws.config_with("memory", Some(&checker), 1, "");
    ws.workflow("ci.yml", "on: push\n");

    let begun = Instant::now();
    let output = ws.run(&["validate", "--mode", "syntax", "--json"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(begun.elapsed() < Duration::from_secs(15), "timeout not enforced");
    assert_eq!(stdout_json(&output)["errors"], 1);
}

// === analytics ===

#[cfg(unix)]
#[test]
fn test_analytics_aggregates_recorded_runs() {
    let ws = Workspace::new();
    let checker = ws.script(
        "lint.sh",
        "case \"$1\" in *broken*) echo \"error: bad key\"; exit 1;; esac\nexit 0\n",
    );
    ws.config("memory", Some(&checker));
    ws.workflow("ci.yml", "on: push\n");

    let output = ws.run(&["validate", "--mode", "syntax", "--json"]);
    assert_eq!(output.status.code(), Some(0));
    ws.workflow("broken.yml", "on push\n");
    let output = ws.run(&["validate", "--mode", "syntax", "--json"]);
    assert_eq!(output.status.code(), Some(1));

    let output = ws.run(&["analytics", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let usage = stdout_json(&output);
    assert_eq!(usage["runs"], 2);
    assert_eq!(usage["by_status"]["success"], 1);
    assert_eq!(usage["by_status"]["errors"], 1);
    assert_eq!(usage["by_command"]["validate"]["runs"], 2);
    assert_eq!(usage["by_workflow"]["ci.yml"]["runs"], 2);
    assert_eq!(usage["by_workflow"]["broken.yml"]["failing_runs"], 1);

    let output = ws.run(&["analytics", "--command", "cleanup"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "No recorded runs.\n");
}
