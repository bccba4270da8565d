//! Client-side rate limiting for remote calls
//!
//! A fixed 60 second window with a burst allowance. Past the burst, a call
//! that would push the observed per-minute rate over the ceiling waits a
//! fixed delay. A low remaining-quota signal from the remote side doubles
//! that delay once, for the rest of the process.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

/// Length of one rate window
pub const WINDOW: Duration = Duration::from_secs(60);

/// Floor for elapsed time when computing a rate, avoids dividing by zero
const MIN_ELAPSED: Duration = Duration::from_millis(1);

/// Rate limiter settings
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Ceiling on calls per minute
    pub per_minute: u32,
    /// Calls admitted without delay at the start of each window
    pub burst_size: u32,
    /// Delay applied to a call over the ceiling
    pub delay: Duration,
    /// Remaining quota below which the delay doubles
    pub low_water: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            burst_size: 10,
            delay: Duration::from_secs(1),
            low_water: 100,
        }
    }
}

/// Time source, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Budget state for the current window
#[derive(Debug, Clone, Serialize)]
pub struct RateBudget {
    #[serde(skip)]
    pub window_start: Instant,
    /// Calls admitted in this window, weighted
    pub ops_in_window: u64,
    /// Calls admitted without delay per window
    pub burst_allowance: u64,
    /// Delay currently applied past the ceiling
    pub delay: Duration,
    /// Whether the one-way backoff has been applied
    pub backed_off: bool,
}

/// Thread-safe rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Box<dyn Clock>,
    budget: Mutex<RateBudget>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Box<dyn Clock>) -> Self {
        let budget = RateBudget {
            window_start: clock.now(),
            ops_in_window: 0,
            burst_allowance: u64::from(config.burst_size),
            delay: config.delay,
            backed_off: false,
        };
        Self {
            config,
            clock,
            budget: Mutex::new(budget),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit one call, sleeping if needed. Returns the delay applied.
    pub fn admit(&self) -> Duration {
        self.admit_weighted(1)
    }

    /// Admit a call that counts as `weight` calls (at least one).
    pub fn admit_weighted(&self, weight: u32) -> Duration {
        let delay = self.reserve(u64::from(weight.max(1)));
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "rate limit delay");
            self.clock.sleep(delay);
        }
        delay
    }

    /// Record `weight` calls and decide the delay. The budget lock is
    /// released before the caller sleeps.
    fn reserve(&self, weight: u64) -> Duration {
        let now = self.clock.now();
        let mut budget = self.lock_budget();

        if now.saturating_duration_since(budget.window_start) >= WINDOW {
            budget.window_start = now;
            budget.ops_in_window = 0;
        }

        budget.ops_in_window += weight;
        if budget.ops_in_window <= budget.burst_allowance {
            return Duration::ZERO;
        }

        let elapsed = now
            .saturating_duration_since(budget.window_start)
            .max(MIN_ELAPSED);
        let per_minute = budget.ops_in_window as f64 * WINDOW.as_secs_f64() / elapsed.as_secs_f64();

        if per_minute > f64::from(self.config.per_minute) {
            budget.delay
        } else {
            Duration::ZERO
        }
    }

    /// Feed back the remote side's remaining quota.
    ///
    /// Below the low-water mark the delay doubles. This happens at most once
    /// and is never undone. Returns whether this call triggered it.
    pub fn observe_remaining(&self, remaining: u64) -> bool {
        if remaining >= self.config.low_water {
            return false;
        }
        let mut budget = self.lock_budget();
        if budget.backed_off {
            return false;
        }
        budget.backed_off = true;
        budget.delay = budget.delay.saturating_mul(2);
        info!(
            remaining,
            low_water = self.config.low_water,
            delay_ms = budget.delay.as_millis() as u64,
            "remote quota low, doubling rate limit delay"
        );
        true
    }

    pub fn current_delay(&self) -> Duration {
        self.lock_budget().delay
    }

    pub fn snapshot(&self) -> RateBudget {
        self.lock_budget().clone()
    }

    fn lock_budget(&self) -> MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
