//! Selection rules of the scheduling policies

use super::classify::ProcessClass;
use super::metrics::SchedulingMetrics;
use super::queue::RunQueue;
use super::{PriorityTier, SchedulingPolicy};
use crate::kernel::Pid;
use std::collections::BTreeMap;

/// Longest slice the realtime tier ever gets (ms)
pub const REALTIME_MAX_SLICE_MS: f64 = 10.0;
/// CFS target latency, split among the runnable processes of a queue (ms)
pub const CFS_TARGET_LATENCY_MS: f64 = 20.0;
/// CFS slice floor (ms)
pub const CFS_MIN_SLICE_MS: f64 = 1.0;
/// Slice multiplier for ai-compute processes under the ai-optimized policy
pub const AI_SLICE_FACTOR: f64 = 4.0;

/// A process to run and for how long
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub pid: Pid,
    pub slice: f64,
}

/// xorshift64, for the ai-optimized weighted pick
#[derive(Debug, Clone)]
pub struct XorShift64(u64);

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x2545_F491_4F6C_DD1D } else { seed })
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Everything a policy may look at
pub(super) struct View<'a> {
    pub queues: &'a mut [RunQueue; 5],
    pub metrics: &'a BTreeMap<Pid, SchedulingMetrics>,
    pub base_slice: f64,
    pub rng: &'a mut XorShift64,
}

impl View<'_> {
    fn runnable(&self) -> impl Iterator<Item = &SchedulingMetrics> {
        self.queues
            .iter()
            .flat_map(|q| q.iter())
            .filter_map(|pid| self.metrics.get(&pid))
    }

    fn first_tier(&self) -> Option<PriorityTier> {
        PriorityTier::ALL
            .into_iter()
            .find(|tier| !self.queues[tier.index()].is_empty())
    }

    fn round_robin(&mut self) -> Option<Selection> {
        let tier = self.first_tier()?;
        let pid = self.queues[tier.index()].rotate()?;
        Some(Selection {
            pid,
            slice: tier.time_slice(self.base_slice),
        })
    }

    fn priority(&mut self) -> Option<Selection> {
        let tier = self.first_tier()?;
        let pid = self.queues[tier.index()].cycle()?;
        Some(Selection {
            pid,
            slice: tier.time_slice(self.base_slice),
        })
    }

    fn cfs(&mut self) -> Option<Selection> {
        let chosen = self
            .runnable()
            .min_by(|a, b| a.vruntime.total_cmp(&b.vruntime).then(a.pid.cmp(&b.pid)))?;
        let peers = self.queues[chosen.tier.index()].len().max(1);
        Some(Selection {
            pid: chosen.pid,
            slice: (CFS_TARGET_LATENCY_MS / peers as f64).max(CFS_MIN_SLICE_MS),
        })
    }

    fn ai_optimized(&mut self) -> Option<Selection> {
        let candidates: Vec<(Pid, u64)> = self
            .runnable()
            .filter(|m| m.class == ProcessClass::AiCompute)
            .map(|m| (m.pid, m.weight.max(1)))
            .collect();
        if candidates.is_empty() {
            return self.priority();
        }
        let total: u64 = candidates.iter().map(|(_, w)| w).sum();
        let mut ticket = self.rng.next_u64() % total;
        let mut chosen = candidates[0].0;
        for (pid, weight) in &candidates {
            if ticket < *weight {
                chosen = *pid;
                break;
            }
            ticket -= weight;
        }
        Some(Selection {
            pid: chosen,
            slice: self.base_slice * AI_SLICE_FACTOR,
        })
    }

    fn realtime(&mut self) -> Option<Selection> {
        let queue = &mut self.queues[PriorityTier::Realtime.index()];
        match queue.cycle() {
            Some(pid) => Some(Selection {
                pid,
                slice: self.base_slice.min(REALTIME_MAX_SLICE_MS),
            }),
            None => self.priority(),
        }
    }

    fn interactive(&mut self) -> Option<Selection> {
        let chosen = self
            .runnable()
            .filter(|m| m.class == ProcessClass::Interactive)
            .min_by(|a, b| a.response_time.total_cmp(&b.response_time).then(a.pid.cmp(&b.pid)))
            .map(|m| (m.pid, m.tier));
        match chosen {
            Some((pid, tier)) => Some(Selection {
                pid,
                slice: tier.time_slice(self.base_slice),
            }),
            None => self.priority(),
        }
    }
}

pub(super) fn select(policy: SchedulingPolicy, view: &mut View<'_>) -> Option<Selection> {
    match policy {
        SchedulingPolicy::RoundRobin => view.round_robin(),
        SchedulingPolicy::Priority => view.priority(),
        SchedulingPolicy::Cfs => view.cfs(),
        SchedulingPolicy::AiOptimized => view.ai_optimized(),
        SchedulingPolicy::Realtime => view.realtime(),
        SchedulingPolicy::Interactive => view.interactive(),
    }
}
