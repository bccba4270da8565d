//! flowkeeper - maintenance toolkit for CI/CD workflows
//!
//! Validates workflow definitions with external checkers and prunes stale
//! run history on the hosted platform. Both commands fan out over the
//! `flowkeeper-runtime` executor, cache and rate limiter, and record their
//! summaries for the usage analytics command.

pub mod analytics;
pub mod cleanup;
pub mod config;
pub mod discover;
pub mod invocation;
pub mod logging;
pub mod progress;
pub mod remote;
pub mod summary;
pub mod validate;

pub use analytics::{aggregate, AnalyticsFilter, RunStatus, UsageReport};
pub use config::{ConfigError, EffectiveConfig, ToolkitConfig};
pub use discover::{discover, DiscoveryError};
pub use invocation::{Invocation, InvocationOptions};
pub use remote::{RemoteClient, RemoteError, RemoteRun};
pub use summary::{ExitCode, RunHistory, RunSummary};
pub use validate::{ValidationItem, ValidationMode, Validator};
