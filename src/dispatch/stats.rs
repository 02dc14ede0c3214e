//! Dispatcher statistics
//!
//! Per-syscall performance counters plus pipeline-wide totals. Latencies
//! are milliseconds on the emulator clock.

use crate::kernel::syscall_name;
use serde::Serialize;
use std::collections::BTreeMap;

/// Performance counters for one syscall number
#[derive(Debug, Clone, Serialize)]
pub struct PerfCounters {
    /// Total call count (successes and errors)
    pub count: u64,
    pub errors: u64,
    /// Total time spent (ms)
    pub total_time: f64,
    pub min_time: f64,
    pub max_time: f64,
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            count: 0,
            errors: 0,
            total_time: 0.0,
            min_time: f64::MAX,
            max_time: 0.0,
        }
    }

    /// Record one call
    pub fn record(&mut self, duration: f64, failed: bool) {
        self.count += 1;
        if failed {
            self.errors += 1;
        }
        self.total_time += duration;
        if duration < self.min_time {
            self.min_time = duration;
        }
        if duration > self.max_time {
            self.max_time = duration;
        }
    }

    /// Average time per call
    pub fn avg_time(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_time / self.count as f64
        }
    }

    /// Minimum, or 0 before the first call
    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min_time }
    }

    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            1.0
        } else {
            (self.count - self.errors) as f64 / self.count as f64
        }
    }
}

/// Pipeline-wide counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub per_syscall: BTreeMap<u32, PerfCounters>,
    pub total_calls: u64,
    pub total_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Calls refused by a security hook (verdict or fail-closed fault)
    pub security_blocks: u64,
    /// Calls aborted by general hooks
    pub hook_aborts: u64,
    pub hook_timeouts: u64,
    pub hook_failures: u64,
    /// Handler panics mapped to EIO
    pub internal_faults: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, nr: u32, duration: f64, failed: bool) {
        self.total_calls += 1;
        if failed {
            self.total_errors += 1;
        }
        self.per_syscall.entry(nr).or_default().record(duration, failed);
    }

    pub fn syscall(&self, nr: u32) -> Option<&PerfCounters> {
        self.per_syscall.get(&nr)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    /// Snapshot for the observability surface
    pub fn metrics(&self, elapsed_ms: f64) -> DispatcherMetrics {
        let throughput = if elapsed_ms > 0.0 {
            self.total_calls as f64 / (elapsed_ms / 1000.0)
        } else {
            0.0
        };
        let mut busiest: Vec<(String, u64)> = self
            .per_syscall
            .iter()
            .map(|(nr, c)| (syscall_name(*nr).to_string(), c.count))
            .collect();
        busiest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        busiest.truncate(5);

        DispatcherMetrics {
            total_calls: self.total_calls,
            total_errors: self.total_errors,
            throughput_per_sec: throughput,
            cache_hit_rate: self.cache_hit_rate(),
            security_blocks: self.security_blocks,
            hook_timeouts: self.hook_timeouts,
            internal_faults: self.internal_faults,
            busiest,
        }
    }
}

/// Dispatcher metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherMetrics {
    pub total_calls: u64,
    pub total_errors: u64,
    pub throughput_per_sec: f64,
    pub cache_hit_rate: f64,
    pub security_blocks: u64,
    pub hook_timeouts: u64,
    pub internal_faults: u64,
    /// Most-called syscalls by name
    pub busiest: Vec<(String, u64)>,
}
