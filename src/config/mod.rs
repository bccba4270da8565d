//! Configuration merge system
//!
//! Implements the 4-layer configuration merge:
//! 1. Built-in defaults
//! 2. Host/user config (~/.config/flowkeeper/config.toml)
//! 3. Repo config (.flowkeeper.toml)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::{
    CheckerConfig, CounterBackend, DiscoveryConfig, RemoteConfig, RetryConfig, StorageConfig,
    ToolkitConfig,
};
pub use effective::{
    host_config_path, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, REPO_CONFIG_FILE,
};
pub use merge::{deep_merge, merge_layers, nested};
