//! Signal handling and cleanup for graceful shutdown
//!
//! The first SIGINT/SIGTERM/SIGHUP sets the cancel token and runs the
//! interrupt hooks (terminating running children). The command then winds
//! down on its own thread: it reports what completed, drains the cleanup
//! registry and exits with code 130.
//!
//! A second signal stops waiting for that: it drains the registry from the
//! handler thread and exits 130 at once. Further signals are ignored.

use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

/// Exit code for interrupted runs
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Result of one cleanup callback
pub type CleanupResult = Result<(), Box<dyn Error + Send + Sync>>;

type CleanupFn = Box<dyn FnOnce() -> CleanupResult + Send>;

type InterruptHook = Box<dyn Fn() + Send + Sync>;

/// What a received signal should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cancel and let the command wind down
    InitiateCancellation,
    /// Second signal: clean up and exit now
    ImmediateExit,
    /// Third and later
    Ignore,
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub ran: usize,
    pub failed: usize,
}

struct Registered {
    name: String,
    callback: CleanupFn,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Registered>,
    drained: bool,
}

/// Ordered, append-only list of cleanup callbacks, drained once.
#[derive(Default)]
pub struct CleanupRegistry {
    state: Mutex<RegistryState>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback. After the registry has drained, the callback runs
    /// immediately instead.
    pub fn register<F>(&self, name: &str, callback: F)
    where
        F: FnOnce() -> CleanupResult + Send + 'static,
    {
        let mut state = self.lock();
        if state.drained {
            drop(state);
            debug!(cleanup = name, "registry already drained, running cleanup now");
            run_one(name, Box::new(callback));
            return;
        }
        state.entries.push(Registered {
            name: name.to_string(),
            callback: Box::new(callback),
        });
    }

    /// Run every callback once, in registration order.
    ///
    /// Entries are taken out of the registry before running so a callback
    /// that registers another does not deadlock. A second drain is a no-op.
    pub fn drain(&self) -> DrainReport {
        let entries = {
            let mut state = self.lock();
            if state.drained {
                return DrainReport::default();
            }
            state.drained = true;
            std::mem::take(&mut state.entries)
        };

        let mut report = DrainReport::default();
        for entry in entries {
            report.ran += 1;
            if !run_one(&entry.name, entry.callback) {
                report.failed += 1;
            }
        }
        debug!(ran = report.ran, failed = report.failed, "cleanup registry drained");
        report
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        self.lock().drained
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one callback, logging and swallowing failures and panics.
fn run_one(name: &str, callback: CleanupFn) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(cleanup = name, error = %e, "cleanup failed");
            false
        }
        Err(_) => {
            warn!(cleanup = name, "cleanup panicked");
            false
        }
    }
}

/// Owns the cleanup registry and the cancel token for one invocation
pub struct SignalManager {
    registry: CleanupRegistry,
    hooks: Mutex<Vec<(String, InterruptHook)>>,
    cancel: CancelToken,
    signal_count: AtomicU8,
}

impl SignalManager {
    pub fn new() -> Self {
        Self {
            registry: CleanupRegistry::new(),
            hooks: Mutex::new(Vec::new()),
            cancel: CancelToken::new(),
            signal_count: AtomicU8::new(0),
        }
    }

    /// Register an idempotent cleanup callback.
    pub fn register<F>(&self, name: &str, callback: F)
    where
        F: FnOnce() -> CleanupResult + Send + 'static,
    {
        self.registry.register(name, callback);
    }

    /// Register a hook run on the first signal, right after cancelling.
    /// Registering after that signal runs the hook immediately.
    pub fn on_interrupt<F>(&self, name: &str, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_interrupted() {
            drop(hooks);
            debug!(hook = name, "already interrupted, running hook now");
            run_hook(name, &hook);
            return;
        }
        hooks.push((name.to_string(), Box::new(hook)));
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.signal_count.load(Ordering::SeqCst) > 0
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Handle a termination signal and say what the process should do next.
    ///
    /// The first call cancels and runs the interrupt hooks. The second drains
    /// the cleanup registry. Later calls do nothing.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self
            .signal_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_add(1)))
            .unwrap_or(u8::MAX);
        match count {
            0 => {
                self.cancel.cancel();
                let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
                for (name, hook) in hooks.iter() {
                    run_hook(name, hook);
                }
                info!(hooks = hooks.len(), "interrupted, winding down");
                SignalAction::InitiateCancellation
            }
            1 => {
                let report = self.registry.drain();
                info!(
                    cleanups = report.ran,
                    failed = report.failed,
                    "interrupted again, cleanup finished"
                );
                SignalAction::ImmediateExit
            }
            _ => SignalAction::Ignore,
        }
    }

    /// Arm SIGINT, SIGTERM and SIGHUP. Call once per process.
    pub fn install(self: &Arc<Self>) -> Result<(), ctrlc::Error> {
        let manager = Arc::clone(self);
        ctrlc::set_handler(move || match manager.handle_signal() {
            SignalAction::InitiateCancellation => {
                eprintln!("\nReceived interrupt signal, finishing up...");
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nReceived second interrupt, exiting immediately.");
                std::process::exit(EXIT_CODE_INTERRUPTED);
            }
            SignalAction::Ignore => {}
        })
    }

    /// Drain on completion, interrupted or not.
    pub fn drain(&self) -> DrainReport {
        self.registry.drain()
    }

    pub fn registry(&self) -> &CleanupRegistry {
        &self.registry
    }
}

fn run_hook(name: &str, hook: &(dyn Fn() + Send + Sync)) {
    if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!(hook = name, "interrupt hook panicked");
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}
