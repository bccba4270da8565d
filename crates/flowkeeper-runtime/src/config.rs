//! Framework tuning knobs
//!
//! Loading and layering is the caller's concern; this module only holds the
//! typed values, their defaults and bounds checks.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rate::RateLimitConfig;
use crate::resource::ResourceLimits;

/// Typed framework configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Upper bound a caller requests before resource adaptation (default: 8)
    pub max_parallel_jobs: usize,

    /// Cache entry time-to-live in seconds (default: 3600)
    pub cache_ttl_seconds: u64,

    /// Memory usage ceiling in percent (default: 80)
    pub memory_limit_percent: f32,

    /// CPU usage ceiling in percent (default: 90)
    pub cpu_limit_percent: f32,

    /// Floor for the worker count (default: 1)
    pub min_parallel_jobs: usize,

    /// Hard ceiling for the worker count regardless of request (default: 16)
    pub max_system_parallel_jobs: usize,

    /// Remote call ceiling over a trailing minute (default: 60)
    pub rate_limit_per_minute: u32,

    /// Calls admitted without delay at the start of a window (default: 10)
    pub burst_size: u32,

    /// Delay applied to a call that would exceed the ceiling (default: 1.0)
    pub rate_limit_delay_seconds: f64,

    /// Remaining-quota low-water mark that doubles the delay (default: 100)
    pub rate_limit_low_water: u64,

    /// Bounded wait for counter lock files (default: 10)
    pub lock_timeout_seconds: u64,

    /// Age beyond which `prune` deletes entries before an invocation (default: 604800)
    pub cache_prune_age_seconds: u64,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 8,
            cache_ttl_seconds: 3600,
            memory_limit_percent: 80.0,
            cpu_limit_percent: 90.0,
            min_parallel_jobs: 1,
            max_system_parallel_jobs: 16,
            rate_limit_per_minute: 60,
            burst_size: 10,
            rate_limit_delay_seconds: 1.0,
            rate_limit_low_water: 100,
            lock_timeout_seconds: 10,
            cache_prune_age_seconds: 7 * 24 * 3600,
        }
    }
}

impl FrameworkConfig {
    /// Check bounds on every knob
    pub fn validate(&self) -> Result<(), FrameworkConfigError> {
        if self.min_parallel_jobs == 0 {
            return Err(FrameworkConfigError::MinJobsZero);
        }
        if self.min_parallel_jobs > self.max_system_parallel_jobs {
            return Err(FrameworkConfigError::JobBoundsInverted {
                min: self.min_parallel_jobs,
                max: self.max_system_parallel_jobs,
            });
        }
        if self.max_parallel_jobs == 0 {
            return Err(FrameworkConfigError::MaxJobsZero);
        }
        for (name, value) in [
            ("memory_limit_percent", self.memory_limit_percent),
            ("cpu_limit_percent", self.cpu_limit_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(FrameworkConfigError::PercentOutOfBounds {
                    name: name.to_string(),
                    value,
                });
            }
        }
        if self.rate_limit_per_minute == 0 {
            return Err(FrameworkConfigError::RateLimitZero);
        }
        if !(self.rate_limit_delay_seconds >= 0.0 && self.rate_limit_delay_seconds.is_finite()) {
            return Err(FrameworkConfigError::DelayOutOfBounds {
                value: self.rate_limit_delay_seconds,
            });
        }
        if self.lock_timeout_seconds == 0 {
            return Err(FrameworkConfigError::LockTimeoutZero);
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn cache_prune_age(&self) -> Duration {
        Duration::from_secs(self.cache_prune_age_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    /// Limits consumed by the resource monitor
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_limit_percent: self.memory_limit_percent,
            cpu_limit_percent: self.cpu_limit_percent,
            min_parallel_jobs: self.min_parallel_jobs,
            max_system_parallel_jobs: self.max_system_parallel_jobs,
        }
    }

    /// Settings consumed by the rate limiter
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            per_minute: self.rate_limit_per_minute,
            burst_size: self.burst_size,
            delay: Duration::from_secs_f64(self.rate_limit_delay_seconds),
            low_water: self.rate_limit_low_water,
        }
    }
}

/// Framework configuration validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameworkConfigError {
    #[error("min_parallel_jobs must be at least 1")]
    MinJobsZero,

    #[error("max_parallel_jobs must be at least 1")]
    MaxJobsZero,

    #[error("min_parallel_jobs ({min}) exceeds max_system_parallel_jobs ({max})")]
    JobBoundsInverted { min: usize, max: usize },

    #[error("{name} must be in (0, 100], got {value}")]
    PercentOutOfBounds { name: String, value: f32 },

    #[error("rate_limit_per_minute must be at least 1")]
    RateLimitZero,

    #[error("rate_limit_delay_seconds must be a finite non-negative number, got {value}")]
    DelayOutOfBounds { value: f64 },

    #[error("lock_timeout_seconds must be at least 1")]
    LockTimeoutZero,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = FrameworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.rate_limit().burst_size, 10);
        assert_eq!(config.resource_limits().max_system_parallel_jobs, 16);
    }

    #[test]
    fn test_inverted_job_bounds() {
        let config = FrameworkConfig {
            min_parallel_jobs: 8,
            max_system_parallel_jobs: 4,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(FrameworkConfigError::JobBoundsInverted { min: 8, max: 4 })
        );
    }

    #[test]
    fn test_percent_bounds() {
        let config = FrameworkConfig {
            memory_limit_percent: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FrameworkConfigError::PercentOutOfBounds { .. })
        ));

        let config = FrameworkConfig {
            cpu_limit_percent: 120.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: FrameworkConfig =
            serde_json::from_value(serde_json::json!({ "burst_size": 3 })).unwrap();
        assert_eq!(config.burst_size, 3);
        assert_eq!(config.rate_limit_per_minute, 60);
    }

    #[test]
    fn test_rate_limit_delay_conversion() {
        let config = FrameworkConfig {
            rate_limit_delay_seconds: 0.25,
            ..Default::default()
        };
        assert_eq!(config.rate_limit().delay, Duration::from_millis(250));
    }
}
