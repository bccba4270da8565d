//! Effective configuration with provenance
//!
//! Layers are merged lowest precedence first: builtin defaults, the host
//! file, the repo file, then command-line overrides. Every file layer is
//! recorded with the SHA-256 of its raw bytes so `config show` can tell
//! which revision of a file produced the running configuration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::defaults::ToolkitConfig;
use super::merge::merge_layers;

/// Repo config file name, looked up in the working directory
pub const REPO_CONFIG_FILE: &str = ".flowkeeper.toml";

/// Placeholder shown instead of a secret value
const MASK: &str = "********";

/// Key fragments that mark a value as secret
const SECRET_MARKERS: [&str; 5] = ["token", "secret", "password", "credential", "api_key"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Repo,
    Cli,
}

/// One layer that contributed to the effective config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// Backing file, for host and repo layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Hex SHA-256 of the file as read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ConfigSource {
    fn inline(origin: ConfigOrigin) -> Self {
        Self {
            origin,
            path: None,
            digest: None,
        }
    }

    /// Read a TOML layer from disk. `Ok(None)` when the file is absent.
    fn read(origin: ConfigOrigin, path: &Path) -> Result<Option<(Self, Value)>, ConfigError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let digest = hex::encode(Sha256::digest(&bytes));

        let parse_err = |reason: String| ConfigError::Parse {
            origin,
            reason: format!("{}: {}", path.display(), reason),
        };
        let text = std::str::from_utf8(&bytes).map_err(|e| parse_err(e.to_string()))?;
        let table: toml::Table = toml::from_str(text).map_err(|e| parse_err(e.to_string()))?;

        let source = Self {
            origin,
            path: Some(path.display().to_string()),
            digest: Some(digest),
        };
        Ok(Some((source, json_from_toml(toml::Value::Table(table)))))
    }
}

/// Merged configuration with the sources it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub created_at: DateTime<Utc>,

    /// Merged JSON value, secrets included
    pub config: Value,

    /// Contributing layers, lowest precedence first
    pub sources: Vec<ConfigSource>,
}

/// `$HOME/.config/flowkeeper/config.toml`, if HOME is set
pub fn host_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".config/flowkeeper/config.toml"))
}

impl EffectiveConfig {
    /// Merge the layers and check the result deserializes and validates.
    ///
    /// A file layer that does not exist is skipped rather than reported.
    pub fn build(
        host: Option<&Path>,
        repo: Option<&Path>,
        overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut sources = vec![ConfigSource::inline(ConfigOrigin::Builtin)];
        let mut layers = vec![ToolkitConfig::builtin_layer()];

        let files = [(ConfigOrigin::Host, host), (ConfigOrigin::Repo, repo)];
        for (origin, path) in files {
            let Some(path) = path else { continue };
            if let Some((source, layer)) = ConfigSource::read(origin, path)? {
                sources.push(source);
                layers.push(layer);
            }
        }

        if let Some(overrides) = overrides {
            sources.push(ConfigSource::inline(ConfigOrigin::Cli));
            layers.push(overrides);
        }

        let effective = Self {
            created_at: Utc::now(),
            config: merge_layers(layers),
            sources,
        };
        effective.toolkit()?;
        Ok(effective)
    }

    /// Typed view of the merged value
    pub fn toolkit(&self) -> Result<ToolkitConfig, ConfigError> {
        let toolkit = ToolkitConfig::deserialize(&self.config).map_err(|e| ConfigError::Parse {
            origin: self.top_origin(),
            reason: e.to_string(),
        })?;
        toolkit
            .framework
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(toolkit)
    }

    fn top_origin(&self) -> ConfigOrigin {
        self.sources
            .last()
            .map(|s| s.origin)
            .unwrap_or(ConfigOrigin::Builtin)
    }

    /// Display copy with secrets masked, and the dotted paths that were masked.
    ///
    /// A secret is any scalar under a key naming one of `SECRET_MARKERS`, or a
    /// `--flag=value` argument inside a command list whose flag does.
    pub fn redacted(&self) -> (Value, Vec<String>) {
        let mut shown = self.config.clone();
        let mut masked = Vec::new();
        mask_secrets(&mut shown, "", &mut masked);
        (shown, masked)
    }

    /// Value at a dotted path such as `framework.burst_size`
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        let pointer: String = dotted.split('.').flat_map(|part| ["/", part]).collect();
        self.config.pointer(&pointer)
    }

    pub fn get_u64(&self, dotted: &str) -> Option<u64> {
        self.get(dotted)?.as_u64()
    }

    pub fn get_str(&self, dotted: &str) -> Option<&str> {
        self.get(dotted)?.as_str()
    }
}

fn names_secret(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| name.contains(marker))
}

fn mask_secrets(value: &mut Value, at: &str, masked: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let path = if at.is_empty() {
                    key.clone()
                } else {
                    format!("{at}.{key}")
                };
                if names_secret(key) && !(child.is_object() || child.is_array()) {
                    *child = Value::from(MASK);
                    masked.push(path);
                } else {
                    mask_secrets(child, &path, masked);
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                let path = format!("{at}[{i}]");
                let Some(arg) = item.as_str() else {
                    mask_secrets(item, &path, masked);
                    continue;
                };
                if let Some((flag, _)) = arg.split_once('=').filter(|(f, _)| f.starts_with('-')) {
                    if names_secret(flag) {
                        *item = Value::from(format!("{flag}={MASK}"));
                        masked.push(path);
                    }
                }
            }
        }
        _ => {}
    }
}

fn json_from_toml(value: toml::Value) -> Value {
    use toml::Value as T;
    match value {
        T::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, v)| (key, json_from_toml(v)))
                .collect(),
        ),
        T::Array(items) => items.into_iter().map(json_from_toml).collect(),
        T::String(s) => s.into(),
        T::Integer(n) => n.into(),
        T::Float(x) => x.into(),
        T::Boolean(b) => b.into(),
        T::Datetime(stamp) => stamp.to_string().into(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid {origin:?} config: {reason}")]
    Parse { origin: ConfigOrigin, reason: String },

    #[error("config rejected: {0}")]
    Invalid(String),
}
