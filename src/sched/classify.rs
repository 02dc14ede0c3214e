//! Process classification
//!
//! `classify` is a pure function of a `BehaviorSnapshot`: the same
//! counters always give the same class. Rules are checked in order and the
//! first match wins.

use crate::kernel::{Pid, VirtualProcess};
use serde::{Deserialize, Serialize};

/// Behavioral class of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessClass {
    System,
    Interactive,
    Background,
    AiCompute,
    IoBound,
    CpuBound,
}

impl ProcessClass {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessClass::System => "system",
            ProcessClass::Interactive => "interactive",
            ProcessClass::Background => "background",
            ProcessClass::AiCompute => "ai-compute",
            ProcessClass::IoBound => "io-bound",
            ProcessClass::CpuBound => "cpu-bound",
        }
    }
}

/// Share of syscalls that are AI operations above which a process is ai-compute
pub const AI_RATIO: f64 = 0.2;
/// Share of syscalls that read the terminal above which a process is interactive
pub const INTERACTION_RATIO: f64 = 0.1;
/// Share of syscalls that are I/O above which a process is io-bound
pub const IO_RATIO: f64 = 0.5;
/// CPU share (cpu time / age) above which a process is cpu-bound
pub const CPU_SHARE: f64 = 0.5;
/// CPU share below which an old enough process is background
pub const BACKGROUND_SHARE: f64 = 0.05;
/// Age before a quiet process counts as background (ms)
pub const BACKGROUND_MIN_AGE_MS: f64 = 1_000.0;
/// Samples needed before memory growth is trusted
pub const MIN_MEMORY_SAMPLES: usize = 4;

/// Counters a classification is computed from
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BehaviorSnapshot {
    pub pid: Pid,
    /// Init and the daemons it runs from /sbin
    pub system: bool,
    pub syscalls: u64,
    pub io_ops: u64,
    pub interactions: u64,
    pub ai_ops: u64,
    /// Accumulated cpu time (ms)
    pub cpu_time: f64,
    /// Time since the process started (ms)
    pub age: f64,
    /// Mapped bytes over time, oldest first
    pub memory_samples: Vec<u64>,
}

impl BehaviorSnapshot {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    pub fn from_process(process: &VirtualProcess, now: f64) -> Self {
        let behavior = &process.behavior;
        Self {
            pid: process.pid,
            system: process.pid == Pid::INIT || (process.uid == 0 && process.command.starts_with("/sbin/")),
            syscalls: behavior.syscalls,
            io_ops: behavior.io_ops,
            interactions: behavior.interactions,
            ai_ops: behavior.ai_ops,
            cpu_time: process.cpu_time,
            age: (now - process.start_time).max(0.0),
            memory_samples: behavior.memory_samples.clone(),
        }
    }

    fn ratio(&self, n: u64) -> f64 {
        if self.syscalls == 0 {
            0.0
        } else {
            n as f64 / self.syscalls as f64
        }
    }

    fn cpu_share(&self) -> f64 {
        if self.age <= 0.0 {
            0.0
        } else {
            self.cpu_time / self.age
        }
    }

    /// Memory never shrinks across the window and at least doubles
    fn memory_climbing(&self) -> bool {
        let samples = &self.memory_samples;
        if samples.len() < MIN_MEMORY_SAMPLES {
            return false;
        }
        let monotonic = samples.windows(2).all(|w| w[0] <= w[1]);
        let first = samples[0].max(1);
        monotonic && samples[samples.len() - 1] >= first * 2
    }
}

pub fn classify(snapshot: &BehaviorSnapshot) -> ProcessClass {
    if snapshot.system {
        return ProcessClass::System;
    }
    // ai ops are counted on the host, so a process may have nothing else
    if snapshot.ai_ops > 0 && (snapshot.syscalls == 0 || snapshot.ratio(snapshot.ai_ops) >= AI_RATIO) {
        return ProcessClass::AiCompute;
    }
    if snapshot.interactions > 0 && snapshot.ratio(snapshot.interactions) >= INTERACTION_RATIO {
        return ProcessClass::Interactive;
    }
    if snapshot.cpu_share() >= CPU_SHARE || snapshot.memory_climbing() {
        return ProcessClass::CpuBound;
    }
    if snapshot.syscalls > 0 && snapshot.ratio(snapshot.io_ops) >= IO_RATIO {
        return ProcessClass::IoBound;
    }
    if snapshot.age >= BACKGROUND_MIN_AGE_MS && snapshot.cpu_share() < BACKGROUND_SHARE {
        return ProcessClass::Background;
    }
    // No history yet: start in the normal tier
    ProcessClass::IoBound
}
