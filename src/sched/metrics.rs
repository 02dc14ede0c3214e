//! Scheduling metrics and load average

use super::PriorityTier;
use super::classify::ProcessClass;
use crate::kernel::Pid;
use serde::Serialize;

/// Weight of a new response-time sample in the moving average
const RESPONSE_ALPHA: f64 = 0.3;

/// Per-process scheduling record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulingMetrics {
    pub pid: Pid,
    pub class: ProcessClass,
    pub tier: PriorityTier,
    /// Accumulated cpu time (ms); the CFS virtual runtime
    pub vruntime: f64,
    pub context_switches: u64,
    /// Quanta granted
    pub time_slices: u64,
    /// Moving average of the wait between becoming ready and running (ms)
    pub response_time: f64,
    /// Weight for the ai-optimized random pick
    pub weight: u64,
    pub runnable: bool,
    pub added_at: f64,
    pub last_scheduled: Option<f64>,
    /// Set while waiting in a run queue
    #[serde(skip)]
    pub(super) ready_since: Option<f64>,
}

impl SchedulingMetrics {
    pub fn new(pid: Pid, class: ProcessClass, tier: PriorityTier, now: f64) -> Self {
        Self {
            pid,
            class,
            tier,
            vruntime: 0.0,
            context_switches: 0,
            time_slices: 0,
            response_time: 0.0,
            weight: 1,
            runnable: true,
            added_at: now,
            last_scheduled: None,
            ready_since: Some(now),
        }
    }

    pub(super) fn record_dispatch(&mut self, now: f64) {
        if let Some(since) = self.ready_since.take() {
            let wait = (now - since).max(0.0);
            self.response_time = if self.time_slices == 0 {
                wait
            } else {
                self.response_time * (1.0 - RESPONSE_ALPHA) + wait * RESPONSE_ALPHA
            };
        }
        self.context_switches += 1;
        self.last_scheduled = Some(now);
    }
}

/// 1, 5 and 15 minute exponentially weighted run-queue load
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl LoadAverage {
    const WINDOWS_MS: [f64; 3] = [60_000.0, 300_000.0, 900_000.0];

    /// Fold in `runnable / cores`, observed for `elapsed_ms`
    pub fn sample(&mut self, runnable: usize, cores: usize, elapsed_ms: f64) {
        if elapsed_ms <= 0.0 {
            return;
        }
        let load = runnable as f64 / cores.max(1) as f64;
        for (avg, window) in [&mut self.one, &mut self.five, &mut self.fifteen]
            .into_iter()
            .zip(Self::WINDOWS_MS)
        {
            let decay = (-elapsed_ms / window).exp();
            *avg = *avg * decay + load * (1.0 - decay);
        }
    }
}

/// Scheduler-wide snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub policy: super::SchedulingPolicy,
    pub current: Option<Pid>,
    pub processes: usize,
    pub runnable: usize,
    /// Runnable count per tier, highest tier first
    pub queue_lengths: [usize; 5],
    pub context_switches: u64,
    pub idle_polls: u64,
    pub load: LoadAverage,
    pub now: f64,
}
