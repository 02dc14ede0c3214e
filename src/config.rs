//! Emulator configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Loaded by the CLI from a file; tests build it in code.

use crate::sched::{PriorityTier, SchedulingPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub kernel: KernelConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
}

impl EmulatorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel.max_processes < 1 {
            return Err(ConfigError::Invalid {
                field: "kernel.max_processes",
                reason: "must allow at least the init process".into(),
            });
        }
        if self.scheduler.base_time_slice_ms <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.base_time_slice_ms",
                reason: "must be positive".into(),
            });
        }
        if self.scheduler.cores == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.cores",
                reason: "must be at least 1".into(),
            });
        }
        if self.dispatcher.audit_capacity == 0 && self.dispatcher.audit_enabled {
            return Err(ConfigError::Invalid {
                field: "dispatcher.audit_capacity",
                reason: "must be non-zero while auditing is enabled".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Process table capacity; fork fails with ENOMEM beyond it
    pub max_processes: usize,
    /// Per-process descriptor limit
    pub max_fds_per_process: usize,
    /// Per-process limit for brk + mmap bookkeeping, in bytes
    pub memory_limit: u64,
    /// Size of each guest's linear memory, in bytes
    pub linear_memory_size: usize,
    /// Wall-clock milliseconds since the Unix epoch at boot (for `time`)
    pub boot_epoch_ms: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: 1024,
            max_fds_per_process: 1024,
            memory_limit: 256 * 1024 * 1024,
            linear_memory_size: 64 * 1024,
            boot_epoch_ms: 1_700_000_000_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Independent timeout applied to each hook invocation
    pub hook_timeout_ms: u64,
    /// TTL for cacheable syscalls without a dedicated TTL
    pub cache_default_ttl_ms: f64,
    pub cache_stat_ttl_ms: f64,
    pub cache_time_ttl_ms: f64,
    pub cache_capacity: usize,
    pub cache_enabled: bool,
    pub audit_enabled: bool,
    /// Bound of the audit ring buffer
    pub audit_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            hook_timeout_ms: 100,
            cache_default_ttl_ms: 2_000.0,
            cache_stat_ttl_ms: 5_000.0,
            cache_time_ttl_ms: 1_000.0,
            cache_capacity: 4096,
            cache_enabled: true,
            audit_enabled: true,
            audit_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub policy: SchedulingPolicy,
    pub base_time_slice_ms: f64,
    /// Simulated core count, used only for load average
    pub cores: usize,
    pub preemption: bool,
    /// Tier that ai-compute processes are placed in
    pub ai_compute_tier: PriorityTier,
    /// Delay before re-polling when nothing is runnable
    pub idle_poll_ms: f64,
    /// Seed for the weighted-random choice of the ai-optimized policy
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::Priority,
            base_time_slice_ms: 10.0,
            cores: 1,
            preemption: true,
            ai_compute_tier: PriorityTier::High,
            idle_poll_ms: 5.0,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }
}
