//! Typed configuration and built-in defaults (layer 1)
//!
//! Every section has a `Default`, and the defaults serialized to JSON form the
//! base layer of the merge.

use std::path::PathBuf;

use flowkeeper_runtime::FrameworkConfig;
use serde::{Deserialize, Serialize};

/// Which counter backend an invocation uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// In-process mutex (default)
    Memory,
    /// Lock file under the state directory, shared across processes
    File,
}

/// Where the toolkit keeps its files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Cache root (default: `$XDG_CACHE_HOME/flowkeeper` or `~/.cache/flowkeeper`)
    pub cache_dir: Option<PathBuf>,

    /// Lock and counter files (default: `~/.local/state/flowkeeper`)
    pub state_dir: Option<PathBuf>,

    /// Counter backend (default: memory)
    pub counter_backend: CounterBackend,

    /// Run summaries kept under `<state_dir>/runs` (0 keeps all)
    pub history_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            state_dir: None,
            counter_backend: CounterBackend::Memory,
            history_limit: 500,
        }
    }
}

impl StorageConfig {
    /// Configured cache directory, or the per-user default
    pub fn resolved_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        if let Some(xdg) = non_empty_env("XDG_CACHE_HOME") {
            return PathBuf::from(xdg).join("flowkeeper");
        }
        match non_empty_env("HOME") {
            Some(home) => PathBuf::from(home).join(".cache").join("flowkeeper"),
            None => PathBuf::from(".flowkeeper").join("cache"),
        }
    }

    /// Configured state directory, or the per-user default
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        if let Some(xdg) = non_empty_env("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("flowkeeper");
        }
        match non_empty_env("HOME") {
            Some(home) => PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("flowkeeper"),
            None => PathBuf::from(".flowkeeper").join("state"),
        }
    }
}

/// External checker commands per validation mode
///
/// Each entry is an argv list; the workflow path is appended. An empty list
/// leaves the mode unconfigured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub syntax: Vec<String>,
    pub security: Vec<String>,
    pub performance: Vec<String>,

    /// Per-invocation timeout for a checker (default: 120)
    pub timeout_seconds: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            syntax: vec!["actionlint".to_string()],
            security: vec!["zizmor".to_string(), "--format".to_string(), "plain".to_string()],
            performance: Vec::new(),
            timeout_seconds: 120,
        }
    }
}

/// Retry policy for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first (default: 3)
    pub max_attempts: u32,

    /// First backoff in milliseconds, doubled per attempt (default: 500)
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds (default: 10000)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// Remote platform transport
///
/// Commands are argv templates; `{id}` is replaced by the run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Lists runs as a JSON array of `{id, created_at, status}`
    pub list: Vec<String>,

    /// Deletes one run
    pub delete: Vec<String>,

    /// Reports remaining quota as JSON with `remaining` or `rate.remaining`
    pub quota: Vec<String>,

    /// Remote calls between quota checks (default: 20, 0 disables)
    pub quota_check_interval: u32,

    /// Per-call timeout (default: 60)
    pub timeout_seconds: u64,

    pub retry: RetryConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            list: argv(&[
                "gh",
                "run",
                "list",
                "--limit",
                "1000",
                "--json",
                "databaseId,createdAt,status,workflowName",
            ]),
            delete: argv(&["gh", "run", "delete", "{id}"]),
            quota: argv(&["gh", "api", "rate_limit"]),
            quota_check_interval: 20,
            timeout_seconds: 60,
            retry: RetryConfig::default(),
        }
    }
}

/// Workflow file discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Roots searched when no paths are given (default: `.github/workflows`)
    pub paths: Vec<PathBuf>,

    /// Globs a file name must match (default: `*.yml`, `*.yaml`)
    pub include: Vec<String>,

    /// Globs that exclude a path
    pub exclude: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from(".github").join("workflows")],
            include: vec!["*.yml".to_string(), "*.yaml".to_string()],
            exclude: Vec::new(),
        }
    }
}

/// Complete typed configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub framework: FrameworkConfig,
    pub storage: StorageConfig,
    pub checkers: CheckerConfig,
    pub remote: RemoteConfig,
    pub discovery: DiscoveryConfig,
}

impl ToolkitConfig {
    /// Built-in defaults as a JSON layer
    pub fn builtin_layer() -> serde_json::Value {
        // Serializing plain data structs cannot fail
        serde_json::to_value(Self::default()).unwrap_or(serde_json::Value::Null)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ToolkitConfig::default();
        assert_eq!(config.framework.max_parallel_jobs, 8);
        assert_eq!(config.storage.counter_backend, CounterBackend::Memory);
        assert_eq!(config.checkers.syntax, vec!["actionlint"]);
        assert!(config.checkers.performance.is_empty());
        assert_eq!(config.remote.retry.max_attempts, 3);
        assert_eq!(config.discovery.include, vec!["*.yml", "*.yaml"]);
    }

    #[test]
    fn test_builtin_layer() {
        let value = ToolkitConfig::builtin_layer();
        assert_eq!(value["framework"]["cache_ttl_seconds"], 3600);
        assert_eq!(value["storage"]["counter_backend"], "memory");
        assert_eq!(value["storage"]["history_limit"], 500);
        assert_eq!(value["remote"]["delete"][3], "{id}");
        assert!(value["storage"]["cache_dir"].is_null());
    }

    #[test]
    fn test_layer_roundtrips_to_defaults() {
        let config: ToolkitConfig = serde_json::from_value(ToolkitConfig::builtin_layer()).unwrap();
        assert_eq!(config, ToolkitConfig::default());
    }

    #[test]
    fn test_explicit_dirs_win() {
        let storage = StorageConfig {
            cache_dir: Some(PathBuf::from("/tmp/fk-cache")),
            state_dir: Some(PathBuf::from("/tmp/fk-state")),
            ..Default::default()
        };
        assert_eq!(storage.resolved_cache_dir(), PathBuf::from("/tmp/fk-cache"));
        assert_eq!(storage.resolved_state_dir(), PathBuf::from("/tmp/fk-state"));
    }
}
