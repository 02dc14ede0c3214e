//! Process scheduler
//!
//! Five priority run queues, one of six policies, and a single "current"
//! process. The scheduler is passive: it only moves when the host calls
//! `tick(elapsed_ms)` or changes the set of runnable processes. A quantum
//! deadline is armed on every decision; when it passes, `tick` decides
//! again. With nothing runnable it re-polls after `idle_poll_ms` instead
//! of deciding on every tick.

pub mod classify;
pub mod metrics;
pub mod policy;
pub mod queue;

pub use classify::{BehaviorSnapshot, ProcessClass, classify};
pub use metrics::{LoadAverage, SchedulerStats, SchedulingMetrics};
pub use policy::Selection;
pub use queue::RunQueue;

use crate::config::SchedulerConfig;
use crate::kernel::Pid;
use policy::{View, XorShift64};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ========== TIERS AND POLICIES ==========

/// Run-queue tier; ordering is by urgency (`Idle < ... < Realtime`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Idle,
    Low,
    Normal,
    High,
    Realtime,
}

impl PriorityTier {
    /// Highest first
    pub const ALL: [PriorityTier; 5] = [
        PriorityTier::Realtime,
        PriorityTier::High,
        PriorityTier::Normal,
        PriorityTier::Low,
        PriorityTier::Idle,
    ];

    /// Position in `ALL`
    pub fn index(self) -> usize {
        match self {
            PriorityTier::Realtime => 0,
            PriorityTier::High => 1,
            PriorityTier::Normal => 2,
            PriorityTier::Low => 3,
            PriorityTier::Idle => 4,
        }
    }

    pub fn time_slice(self, base_ms: f64) -> f64 {
        match self {
            PriorityTier::Realtime => base_ms.min(policy::REALTIME_MAX_SLICE_MS),
            PriorityTier::High => base_ms * 2.0,
            PriorityTier::Normal => base_ms,
            PriorityTier::Low => base_ms * 0.5,
            PriorityTier::Idle => base_ms * 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingPolicy {
    RoundRobin,
    #[default]
    Priority,
    Cfs,
    AiOptimized,
    Realtime,
    Interactive,
}

impl std::str::FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(SchedulingPolicy::RoundRobin),
            "priority" => Ok(SchedulingPolicy::Priority),
            "cfs" => Ok(SchedulingPolicy::Cfs),
            "ai-optimized" => Ok(SchedulingPolicy::AiOptimized),
            "realtime" => Ok(SchedulingPolicy::Realtime),
            "interactive" => Ok(SchedulingPolicy::Interactive),
            other => Err(format!("unknown scheduling policy `{other}`")),
        }
    }
}

// ========== SCHEDULER ==========

pub struct Scheduler {
    config: SchedulerConfig,
    policy: SchedulingPolicy,
    queues: [RunQueue; 5],
    metrics: BTreeMap<Pid, SchedulingMetrics>,
    current: Option<Pid>,
    /// One-shot quantum deadline of the current process
    quantum_deadline: Option<f64>,
    /// When to look again while idle
    next_poll: Option<f64>,
    now: f64,
    context_switches: u64,
    idle_polls: u64,
    load: LoadAverage,
    rng: XorShift64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            policy: config.policy,
            rng: XorShift64::new(config.seed),
            config,
            queues: Default::default(),
            metrics: BTreeMap::new(),
            current: None,
            quantum_deadline: None,
            next_poll: None,
            now: 0.0,
            context_switches: 0,
            idle_polls: 0,
            load: LoadAverage::default(),
        }
    }

    /// Tier a class is served in
    pub fn tier_for(&self, class: ProcessClass) -> PriorityTier {
        match class {
            ProcessClass::System => PriorityTier::Realtime,
            ProcessClass::Interactive => PriorityTier::High,
            ProcessClass::AiCompute => self.config.ai_compute_tier,
            ProcessClass::IoBound => PriorityTier::Normal,
            ProcessClass::CpuBound => PriorityTier::Low,
            ProcessClass::Background => PriorityTier::Idle,
        }
    }

    /// Classify and enqueue a process; returns its class
    ///
    /// An already known pid is reclassified instead.
    pub fn add_process(&mut self, snapshot: &BehaviorSnapshot) -> ProcessClass {
        if self.metrics.contains_key(&snapshot.pid) {
            return self.reclassify(snapshot);
        }
        let class = classify(snapshot);
        let tier = self.tier_for(class);
        let mut record = SchedulingMetrics::new(snapshot.pid, class, tier, self.now);
        record.vruntime = snapshot.cpu_time;
        record.weight = snapshot.ai_ops + 1;
        self.metrics.insert(snapshot.pid, record);
        self.queues[tier.index()].push(snapshot.pid);
        tracing::debug!(pid = %snapshot.pid, class = class.name(), ?tier, "process added");

        self.on_arrival(tier);
        class
    }

    /// Drop a process; absent pids are ignored
    pub fn remove_process(&mut self, pid: Pid) {
        let Some(record) = self.metrics.remove(&pid) else {
            return;
        };
        self.queues[record.tier.index()].remove(pid);
        if self.current == Some(pid) {
            self.current = None;
            self.schedule();
        }
    }

    /// Put a process on or off the run queues, keeping its metrics
    pub fn set_runnable(&mut self, pid: Pid, runnable: bool) {
        let now = self.now;
        let Some(record) = self.metrics.get_mut(&pid) else {
            return;
        };
        if record.runnable == runnable {
            return;
        }
        record.runnable = runnable;
        let tier = record.tier;
        if runnable {
            record.ready_since = Some(now);
            self.queues[tier.index()].push(pid);
            self.on_arrival(tier);
        } else {
            record.ready_since = None;
            self.queues[tier.index()].remove(pid);
            if self.current == Some(pid) {
                self.current = None;
                self.schedule();
            }
        }
    }

    /// Recompute a process's class from fresh counters, moving tiers if needed
    pub fn reclassify(&mut self, snapshot: &BehaviorSnapshot) -> ProcessClass {
        let class = classify(snapshot);
        let tier = self.tier_for(class);
        let Some(record) = self.metrics.get_mut(&snapshot.pid) else {
            return class;
        };
        let old_tier = record.tier;
        record.class = class;
        record.tier = tier;
        record.weight = snapshot.ai_ops + 1;
        let runnable = record.runnable;
        if old_tier != tier && runnable {
            self.queues[old_tier.index()].remove(snapshot.pid);
            self.queues[tier.index()].push(snapshot.pid);
            tracing::debug!(pid = %snapshot.pid, from = ?old_tier, to = ?tier, "process moved");
            if tier > old_tier && self.current != Some(snapshot.pid) {
                self.on_arrival(tier);
            }
        }
        class
    }

    pub fn set_policy(&mut self, policy: SchedulingPolicy) {
        if policy != self.policy {
            tracing::debug!(from = ?self.policy, to = ?policy, "scheduling policy changed");
            self.policy = policy;
            self.schedule();
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Advance time; returns the process that is current afterwards
    pub fn tick(&mut self, elapsed_ms: f64) -> Option<Pid> {
        let elapsed = elapsed_ms.max(0.0);
        self.now += elapsed;
        if let Some(record) = self.current.and_then(|pid| self.metrics.get_mut(&pid)) {
            record.vruntime += elapsed;
        }
        self.load
            .sample(self.runnable_count(), self.config.cores, elapsed);

        match self.current {
            Some(_) => {
                if self.quantum_deadline.is_some_and(|deadline| self.now >= deadline) {
                    self.schedule();
                }
            }
            None => {
                if self.next_poll.is_none_or(|at| self.now >= at) {
                    self.schedule();
                }
            }
        }
        self.current
    }

    /// Decide now, regardless of the quantum
    pub fn schedule(&mut self) -> Option<Pid> {
        let mut view = View {
            queues: &mut self.queues,
            metrics: &self.metrics,
            base_slice: self.config.base_time_slice_ms,
            rng: &mut self.rng,
        };
        match policy::select(self.policy, &mut view) {
            Some(selection) => self.switch_to(selection),
            None => {
                self.current = None;
                self.quantum_deadline = None;
                self.next_poll = Some(self.now + self.config.idle_poll_ms);
                self.idle_polls += 1;
            }
        }
        self.current
    }

    fn switch_to(&mut self, selection: Selection) {
        let now = self.now;
        let previous = self.current;
        if previous != Some(selection.pid) {
            if let Some(outgoing) = previous.and_then(|pid| self.metrics.get_mut(&pid)) {
                if outgoing.runnable {
                    outgoing.ready_since = Some(now);
                }
            }
            if let Some(incoming) = self.metrics.get_mut(&selection.pid) {
                incoming.record_dispatch(now);
            }
            self.context_switches += 1;
            tracing::trace!(from = ?previous, to = %selection.pid, slice = selection.slice, "context switch");
        }
        if let Some(record) = self.metrics.get_mut(&selection.pid) {
            record.time_slices += 1;
        }
        self.current = Some(selection.pid);
        self.quantum_deadline = Some(now + selection.slice);
        self.next_poll = None;
    }

    /// Preempt for an urgent arrival, or start running if idle
    fn on_arrival(&mut self, tier: PriorityTier) {
        let current_tier = self
            .current
            .and_then(|pid| self.metrics.get(&pid))
            .map(|m| m.tier);
        let Some(current_tier) = current_tier else {
            self.schedule();
            return;
        };
        let forced = tier == PriorityTier::Realtime
            && matches!(self.policy, SchedulingPolicy::Priority | SchedulingPolicy::Realtime);
        let urgent = tier >= PriorityTier::High && tier > current_tier;
        if (forced && tier > current_tier) || (self.config.preemption && urgent) {
            tracing::trace!(?tier, "preempting for arrival");
            self.schedule();
        }
    }

    // ========== OBSERVATION ==========

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// Time left in the current quantum
    pub fn quantum_remaining(&self) -> Option<f64> {
        self.quantum_deadline.map(|d| (d - self.now).max(0.0))
    }

    pub fn metrics(&self, pid: Pid) -> Option<&SchedulingMetrics> {
        self.metrics.get(&pid)
    }

    pub fn all_metrics(&self) -> impl Iterator<Item = &SchedulingMetrics> {
        self.metrics.values()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.metrics.contains_key(&pid)
    }

    pub fn runnable_count(&self) -> usize {
        self.queues.iter().map(RunQueue::len).sum()
    }

    pub fn load_average(&self) -> LoadAverage {
        self.load
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut queue_lengths = [0; 5];
        for (slot, queue) in queue_lengths.iter_mut().zip(&self.queues) {
            *slot = queue.len();
        }
        SchedulerStats {
            policy: self.policy,
            current: self.current,
            processes: self.metrics.len(),
            runnable: self.runnable_count(),
            queue_lengths,
            context_switches: self.context_switches,
            idle_polls: self.idle_polls,
            load: self.load,
            now: self.now,
        }
    }
}
