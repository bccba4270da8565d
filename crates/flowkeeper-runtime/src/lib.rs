//! flowkeeper-runtime: resource-aware parallel execution and caching
//!
//! Building blocks for maintenance commands that fan work out over many
//! files or remote records:
//! - [`cache`]: content-addressed, TTL-bounded file cache
//! - [`rate`]: client-side throttle for remote calls
//! - [`resource`]: host sampling and safe worker counts
//! - [`executor`]: bounded thread pool with contained failures
//! - [`counter`]: linearizable counters, in-memory or lock-file backed
//! - [`signal`]: cleanup registry and termination handling

pub mod cache;
pub mod config;
pub mod counter;
pub mod error;
pub mod executor;
pub mod lock;
pub mod progress;
pub mod rate;
pub mod resource;
pub mod signal;

pub use cache::{CacheError, CacheKey, CacheStore};
pub use config::{FrameworkConfig, FrameworkConfigError};
pub use counter::{Counter, CounterError, CounterTotals, FileCounter, MemoryCounter, SharedCounters};
pub use error::{ErrorKind, RuntimeError, RuntimeResult};
pub use executor::{
    cached_outcome, ChildRegistry, CompletedItem, OutputSink, ParallelExecutor, PolicyOutcome,
    ProcessOutput, ProcessTask, RunReport, StderrSink, StdoutSink,
};
pub use progress::{ChannelProgress, NoProgress, ProgressEvent, ProgressSink};
pub use rate::{RateLimitConfig, RateLimiter};
pub use resource::{ResourceLimits, ResourceMonitor, ResourceSample, ThresholdStatus};
pub use signal::{CancelToken, CleanupResult, SignalAction, SignalManager, EXIT_CODE_INTERRUPTED};
