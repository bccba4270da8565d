//! Child processes run on behalf of a policy
//!
//! A [`ProcessTask`] spawns a command in its own process group, streams its
//! output into memory and polls for exit. On cancellation or timeout it sends
//! SIGTERM to the group, waits a grace period, then kills. Once the direct
//! child is gone the rest of its group is killed too, and the output pipes
//! are drained against a deadline, so a descendant that kept a pipe open
//! cannot hold the caller past the timeout.
//!
//! Running children are tracked in a [`ChildRegistry`]. Terminating the
//! registry also closes it: a child registered afterwards is terminated on
//! the spot.

use std::collections::HashSet;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::signal::CancelToken;

/// Default grace period between SIGTERM and kill
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// How long output may keep arriving after the child's group is gone
pub const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between exit polls
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct Tracked {
    pids: HashSet<u32>,
    closed: bool,
}

/// Pids of children currently running
#[derive(Debug, Default)]
pub struct ChildRegistry {
    state: Mutex<Tracked>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pid`. Returns false, after terminating its process group,
    /// when the registry has already been terminated.
    pub fn register(&self, pid: u32) -> bool {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            debug!(pid, "registry closed, terminating late child");
            send_term(pid);
            return false;
        }
        state.pids.insert(pid);
        true
    }

    pub fn unregister(&self, pid: u32) {
        self.lock().pids.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.lock().pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Send SIGTERM to every registered child's process group and refuse
    /// further children. Returns how many were signalled.
    pub fn terminate_all(&self) -> usize {
        let pids: Vec<u32> = {
            let mut state = self.lock();
            state.closed = true;
            state.pids.drain().collect()
        };
        for pid in &pids {
            send_term(*pid);
        }
        if !pids.is_empty() {
            debug!(count = pids.len(), "terminated running children");
        }
        pids.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Captured result of a child process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code, absent when killed by a signal
    pub status: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0) && !self.cancelled && !self.timed_out
    }

    /// Exit code for reporting; signal deaths map to `128 + signal`
    pub fn exit_code(&self) -> i32 {
        match (self.status, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        }
    }
}

/// A command to run to completion
#[derive(Debug, Clone)]
pub struct ProcessTask {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    cancel: Option<CancelToken>,
    children: Option<Arc<ChildRegistry>>,
    timeout: Option<Duration>,
    grace: Duration,
}

impl ProcessTask {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            cancel: None,
            children: None,
            timeout: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Build from an argv list; the first element is the program.
    pub fn from_argv(argv: &[String]) -> io::Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty command")
        })?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_registry(mut self, children: Arc<ChildRegistry>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Human-readable command line, for logs and cache contexts
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawn and wait. Spawn failures are returned as errors; a non-zero
    /// exit is reported in the output.
    ///
    /// A task whose cancel token is already set, or whose registry has been
    /// terminated, is not spawned and reports `cancelled`.
    pub fn run(&self) -> io::Result<ProcessOutput> {
        if self.should_stop() {
            return Ok(ProcessOutput {
                cancelled: true,
                ..Default::default()
            });
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            // Own process group so termination reaches grandchildren too
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let start = Instant::now();
        let mut child = command.spawn()?;
        let pid = child.id();
        if let Some(children) = &self.children {
            children.register(pid);
        }

        let stdout_rx = spawn_reader(child.stdout.take());
        let stderr_rx = spawn_reader(child.stderr.take());

        let result = self.wait(&mut child, start);

        if let Some(children) = &self.children {
            children.unregister(pid);
        }
        // Whatever the child left running in its group goes with it
        kill_group(pid);

        let (status, cancelled, timed_out) = match result {
            Ok(waited) => waited,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let deadline = Instant::now() + PIPE_DRAIN_TIMEOUT;
        let stdout = drain_reader(&stdout_rx, deadline);
        let stderr = drain_reader(&stderr_rx, deadline);

        let (code, signal) = split_status(&status);
        Ok(ProcessOutput {
            status: code,
            signal,
            stdout,
            stderr,
            cancelled,
            timed_out,
            duration: start.elapsed(),
        })
    }

    fn should_stop(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
            || self.children.as_ref().is_some_and(|c| c.is_closed())
    }

    fn wait(
        &self,
        child: &mut Child,
        start: Instant,
    ) -> io::Result<(std::process::ExitStatus, bool, bool)> {
        loop {
            if let Some(status) = child.try_wait()? {
                // A child that died to an outside terminate_all still counts as cancelled
                return Ok((status, self.should_stop(), false));
            }

            let cancelled = self.should_stop();
            let timed_out = self.timeout.map(|t| start.elapsed() >= t).unwrap_or(false);
            if cancelled || timed_out {
                debug!(
                    command = %self.display(),
                    cancelled,
                    timed_out,
                    "terminating child"
                );
                let status = self.terminate_child(child)?;
                return Ok((status, cancelled, timed_out));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGTERM, wait out the grace period, then kill.
    fn terminate_child(&self, child: &mut Child) -> io::Result<std::process::ExitStatus> {
        send_term(child.id());

        let start = Instant::now();
        while start.elapsed() < self.grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(POLL_INTERVAL);
        }

        kill_group(child.id());
        let _ = child.kill();
        child.wait()
    }
}

/// Forward a pipe to a channel chunk by chunk; the channel closes at EOF.
fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let Some(mut source) = source else { return };
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

/// Collect chunks until EOF or `deadline`, whichever comes first.
fn drain_reader(rx: &Receiver<Vec<u8>>, deadline: Instant) -> String {
    let mut bytes = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                debug!("output pipe still open after the child exited, giving up on it");
                break;
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn split_status(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

#[cfg(unix)]
fn send_term(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}
