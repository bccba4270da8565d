//! Host resource sampling and adaptive job counts
//!
//! Sampling is best-effort: when the OS cannot be queried the monitor falls
//! back to a neutral sample so a job count can always be computed.

use std::fmt;
use std::thread;

use serde::Serialize;
use sysinfo::System;
use tracing::{debug, warn};

/// Resource ceilings and worker bounds
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_limit_percent: f32,
    pub cpu_limit_percent: f32,
    pub min_parallel_jobs: usize,
    pub max_system_parallel_jobs: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_percent: 80.0,
            cpu_limit_percent: 90.0,
            min_parallel_jobs: 1,
            max_system_parallel_jobs: 16,
        }
    }
}

/// Point-in-time host load
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub mem_percent: f32,
    pub cpu_percent: f32,
    pub cores: usize,
}

impl ResourceSample {
    /// Zero load with the detected core count (or 1)
    pub fn neutral() -> Self {
        Self {
            mem_percent: 0.0,
            cpu_percent: 0.0,
            cores: detected_cores(),
        }
    }
}

/// Outcome of comparing a sample against the ceilings
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdStatus {
    Ok,
    Constrained(String),
}

impl fmt::Display for ThresholdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdStatus::Ok => write!(f, "ok"),
            ThresholdStatus::Constrained(reason) => write!(f, "constrained: {}", reason),
        }
    }
}

/// Source of resource samples
pub trait ResourceSampler: Send + Sync {
    /// `None` when the host cannot be queried
    fn sample(&self) -> Option<ResourceSample>;
}

/// Sampler backed by `sysinfo`
///
/// CPU usage needs two refreshes separated by the sysinfo minimum interval,
/// so one sample takes a fraction of a second.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoSampler;

impl ResourceSampler for SysinfoSampler {
    fn sample(&self) -> Option<ResourceSample> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }

        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        let mem_percent = (sys.used_memory() as f64 / total as f64 * 100.0) as f32;

        sys.refresh_cpu_usage();
        thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        let cpu_percent = sys.global_cpu_usage();

        let cores = match sys.cpus().len() {
            0 => detected_cores(),
            n => n,
        };

        Some(ResourceSample {
            mem_percent,
            cpu_percent,
            cores,
        })
    }
}

/// Fixed sample, for tests and `--jobs` overrides
#[derive(Debug, Clone, Copy)]
pub struct StaticSampler(pub Option<ResourceSample>);

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> Option<ResourceSample> {
        self.0
    }
}

/// Computes safe worker counts from host load
pub struct ResourceMonitor {
    limits: ResourceLimits,
    sampler: Box<dyn ResourceSampler>,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_sampler(limits, Box::new(SysinfoSampler))
    }

    pub fn with_sampler(limits: ResourceLimits, sampler: Box<dyn ResourceSampler>) -> Self {
        Self { limits, sampler }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Sample the host, falling back to a neutral sample.
    pub fn sample(&self) -> ResourceSample {
        match self.sampler.sample() {
            Some(sample) => {
                debug!(
                    mem = sample.mem_percent,
                    cpu = sample.cpu_percent,
                    cores = sample.cores,
                    "resource sample"
                );
                sample
            }
            None => {
                warn!("resource query unavailable, assuming an idle host");
                ResourceSample::neutral()
            }
        }
    }

    /// Sample once and size the worker pool.
    pub fn safe_job_count(&self, requested: usize) -> usize {
        let sample = self.sample();
        self.safe_job_count_for(requested, &sample)
    }

    /// Worker count for `requested` under `sample`.
    ///
    /// Starts from `min(requested, max_system)` and shrinks it by the larger
    /// relative overage of memory or CPU, never below `min_parallel_jobs`.
    /// An overage is how far past its ceiling a reading is, as a fraction of
    /// the headroom the ceiling left.
    pub fn safe_job_count_for(&self, requested: usize, sample: &ResourceSample) -> usize {
        let min = self.limits.min_parallel_jobs.max(1);
        let base = requested.min(self.limits.max_system_parallel_jobs).max(min);

        let overage = overage(sample.mem_percent, self.limits.memory_limit_percent)
            .max(overage(sample.cpu_percent, self.limits.cpu_limit_percent));
        if overage <= 0.0 {
            return base;
        }

        let reduced = (base as f64 * (1.0 - overage)).floor() as usize;
        let jobs = reduced.clamp(min, base);
        debug!(requested, base, jobs, overage, "reduced job count under load");
        jobs
    }

    /// Report which ceilings a sample exceeds. Never aborts.
    pub fn check_thresholds(&self, sample: &ResourceSample) -> ThresholdStatus {
        let mut reasons = Vec::new();
        if sample.mem_percent > self.limits.memory_limit_percent {
            reasons.push(format!(
                "memory {:.1}% over {:.1}%",
                sample.mem_percent, self.limits.memory_limit_percent
            ));
        }
        if sample.cpu_percent > self.limits.cpu_limit_percent {
            reasons.push(format!(
                "cpu {:.1}% over {:.1}%",
                sample.cpu_percent, self.limits.cpu_limit_percent
            ));
        }
        if reasons.is_empty() {
            ThresholdStatus::Ok
        } else {
            ThresholdStatus::Constrained(reasons.join(", "))
        }
    }
}

fn overage(observed: f32, limit: f32) -> f64 {
    if observed <= limit {
        return 0.0;
    }
    let headroom = f64::from(100.0 - limit).max(1.0);
    (f64::from(observed - limit) / headroom).min(1.0)
}

fn detected_cores() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
