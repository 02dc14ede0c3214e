//! Per-process syscall profile, collected by a post-hook

use super::SyscallContext;
use super::hooks::{HookError, SyscallHook};
use super::stats::PerfCounters;
use crate::kernel::Pid;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Syscall counters of one process
#[derive(Debug, Clone, Default)]
pub struct ProcessProfile {
    pub calls: BTreeMap<u32, PerfCounters>,
    pub cached: u64,
    pub blocked: u64,
}

impl ProcessProfile {
    pub fn total_calls(&self) -> u64 {
        self.calls.values().map(|c| c.count).sum()
    }
}

#[derive(Debug, Default)]
pub struct ProfilingHook {
    profiles: Mutex<HashMap<Pid, ProcessProfile>>,
}

impl ProfilingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profile(&self, pid: Pid) -> Option<ProcessProfile> {
        self.profiles.lock().ok()?.get(&pid).cloned()
    }

    /// Processes ordered by total syscalls, busiest first
    pub fn busiest(&self, n: usize) -> Vec<(Pid, u64)> {
        let Ok(profiles) = self.profiles.lock() else {
            return Vec::new();
        };
        let mut ranked: Vec<(Pid, u64)> = profiles.iter().map(|(pid, p)| (*pid, p.total_calls())).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn forget(&self, pid: Pid) {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.remove(&pid);
        }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl SyscallHook for ProfilingHook {
    fn name(&self) -> &str {
        "profiling"
    }

    async fn after_syscall(&self, ctx: &SyscallContext) -> Result<(), HookError> {
        let mut profiles = self
            .profiles
            .lock()
            .map_err(|_| HookError::Failed("profile table poisoned".into()))?;
        let profile = profiles.entry(ctx.pid).or_default();
        profile
            .calls
            .entry(ctx.nr)
            .or_default()
            .record(ctx.duration_ms, ctx.errno.is_some());
        profile.cached += ctx.cached as u64;
        profile.blocked += ctx.blocked as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Errno, SyscallArgs};

    #[tokio::test]
    async fn test_collects_per_pid() {
        let hook = ProfilingHook::new();
        for pid in [1, 1, 2] {
            let ctx = SyscallContext::new(Pid(pid), 39, SyscallArgs::default(), 0.0);
            hook.after_syscall(&ctx).await.unwrap();
        }
        let mut failed = SyscallContext::new(Pid(2), 0, SyscallArgs::default(), 0.0);
        failed.errno = Some(Errno::EBADF);
        hook.after_syscall(&failed).await.unwrap();

        assert_eq!(hook.profile(Pid(1)).unwrap().total_calls(), 2);
        assert_eq!(hook.profile(Pid(2)).unwrap().calls[&0].errors, 1);
        assert_eq!(hook.busiest(1), vec![(Pid(1), 2)]);

        hook.forget(Pid(1));
        assert!(hook.profile(Pid(1)).is_none());
    }
}
