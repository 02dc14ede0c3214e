//! The emulator: kernel, dispatcher and scheduler behind one control path
//!
//! Only the scheduler's current process may issue syscalls; anyone else
//! gets EAGAIN and should retry once it is scheduled. After every syscall
//! the kernel's lifecycle events are drained into the scheduler and the
//! dispatcher cache, so the three never disagree about which processes
//! exist and which can run.

use crate::clock::{Clock, ManualClock};
use crate::config::{ConfigError, EmulatorConfig};
use crate::dispatch::{Dispatcher, DispatcherMetrics, SyscallHook};
use crate::kernel::{
    Errno, Kernel, KernelEvent, Pid, ProgramLoader, SyscallArgs, SyscallReturn, ValidatingLoader,
};
use crate::sched::{BehaviorSnapshot, ProcessClass, Scheduler, SchedulerStats, SchedulingMetrics};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("boot failed: {0}")]
    Boot(Errno),
}

/// Combined observability snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EmulatorMetrics {
    pub now: f64,
    pub processes: usize,
    pub dispatcher: DispatcherMetrics,
    pub scheduler: SchedulerStats,
    pub per_process: Vec<SchedulingMetrics>,
}

pub struct Emulator {
    dispatcher: Dispatcher<Kernel>,
    scheduler: Scheduler,
    clock: ManualClock,
}

impl Emulator {
    /// Boot with the default loader on a clock starting at zero
    pub fn boot(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        Self::boot_with(config, ManualClock::new(), Box::new(ValidatingLoader))
    }

    pub fn boot_with(
        config: EmulatorConfig,
        clock: ManualClock,
        loader: Box<dyn ProgramLoader>,
    ) -> Result<Self, EmulatorError> {
        config.validate()?;
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let kernel = Kernel::boot(config.kernel.clone(), shared.clone(), loader).map_err(EmulatorError::Boot)?;
        let dispatcher = Dispatcher::new(kernel, config.dispatcher.clone(), shared);
        let scheduler = Scheduler::new(config.scheduler.clone());

        let mut emulator = Self {
            dispatcher,
            scheduler,
            clock,
        };
        let pids: Vec<Pid> = emulator.kernel().processes().filter(|p| p.is_alive()).map(|p| p.pid).collect();
        for pid in pids {
            if let Some(snapshot) = emulator.snapshot(pid) {
                emulator.scheduler.add_process(&snapshot);
            }
        }
        tracing::info!(policy = ?emulator.scheduler.policy(), "emulator ready");
        Ok(emulator)
    }

    /// Issue a syscall on behalf of `pid`
    pub async fn syscall(&mut self, pid: Pid, nr: u32, args: SyscallArgs) -> SyscallReturn {
        if self.scheduler.current() != Some(pid) {
            return SyscallReturn::err(Errno::EAGAIN);
        }
        let result = self.dispatcher.dispatch(pid, nr, args).await;
        self.sync_events();
        result
    }

    /// Advance emulated time; returns the current process afterwards
    pub fn tick(&mut self, elapsed_ms: f64) -> Option<Pid> {
        let elapsed = elapsed_ms.max(0.0);
        self.clock.advance(elapsed);
        if let Some(pid) = self.scheduler.current() {
            self.dispatcher.handler_mut().charge_cpu(pid, elapsed);
        }
        self.scheduler.tick(elapsed)
    }

    /// Tick in `step_ms` increments until `pid` is current or `budget_ms`
    /// runs out
    pub fn run_until_current(&mut self, pid: Pid, step_ms: f64, budget_ms: f64) -> bool {
        let mut spent = 0.0;
        while self.scheduler.current() != Some(pid) {
            if spent >= budget_ms || !self.scheduler.contains(pid) {
                return false;
            }
            self.tick(step_ms);
            spent += step_ms;
        }
        true
    }

    /// Re-run classification for a process from its current counters
    pub fn reclassify(&mut self, pid: Pid) -> Option<ProcessClass> {
        let snapshot = self.snapshot(pid)?;
        Some(self.scheduler.reclassify(&snapshot))
    }

    /// Record a host-side AI operation for `pid` (feeds classification)
    pub fn record_ai_op(&mut self, pid: Pid) {
        self.dispatcher.handler_mut().record_ai_op(pid);
    }

    pub fn register_hook(&mut self, hook: Arc<dyn SyscallHook>) {
        self.dispatcher.register_hook(hook);
    }

    pub fn current(&self) -> Option<Pid> {
        self.scheduler.current()
    }

    pub fn now(&self) -> f64 {
        self.clock.now_ms()
    }

    pub fn kernel(&self) -> &Kernel {
        self.dispatcher.handler()
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        self.dispatcher.handler_mut()
    }

    pub fn dispatcher(&self) -> &Dispatcher<Kernel> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<Kernel> {
        &mut self.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn metrics(&self) -> EmulatorMetrics {
        EmulatorMetrics {
            now: self.now(),
            processes: self.kernel().process_count(),
            dispatcher: self.dispatcher.metrics(),
            scheduler: self.scheduler.stats(),
            per_process: self.scheduler.all_metrics().cloned().collect(),
        }
    }

    fn snapshot(&self, pid: Pid) -> Option<BehaviorSnapshot> {
        let process = self.kernel().process(pid)?;
        Some(BehaviorSnapshot::from_process(process, self.now()))
    }

    fn runnable(&self, pid: Pid) -> bool {
        self.kernel().process(pid).is_some_and(|p| p.can_run())
    }

    /// Apply kernel lifecycle events to the scheduler and the cache
    fn sync_events(&mut self) {
        let events = self.dispatcher.handler_mut().take_events();
        for event in events {
            tracing::trace!(?event, "kernel event");
            match event {
                KernelEvent::Spawned { pid, .. } => {
                    if let Some(snapshot) = self.snapshot(pid) {
                        self.scheduler.add_process(&snapshot);
                    }
                }
                KernelEvent::Execed { pid } => {
                    self.dispatcher.invalidate_pid(pid);
                    self.reclassify(pid);
                }
                KernelEvent::Exited { pid, .. } => {
                    self.scheduler.remove_process(pid);
                    self.dispatcher.invalidate_pid(pid);
                }
                KernelEvent::Reaped { pid } => self.dispatcher.invalidate_pid(pid),
                KernelEvent::Stopped { pid } | KernelEvent::Blocked { pid } => {
                    self.scheduler.set_runnable(pid, false);
                }
                KernelEvent::Continued { pid } | KernelEvent::Woken { pid } => {
                    let runnable = self.runnable(pid);
                    self.scheduler.set_runnable(pid, runnable);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SyscallNr;
    use crate::sched::SchedulingPolicy;

    fn emulator(policy: SchedulingPolicy) -> Emulator {
        let mut config = EmulatorConfig::default();
        config.scheduler.policy = policy;
        Emulator::boot(config).unwrap()
    }

    async fn call(emu: &mut Emulator, pid: Pid, nr: SyscallNr, args: &[u64]) -> SyscallReturn {
        emu.syscall(pid, nr.num(), SyscallArgs::new(args)).await
    }

    #[tokio::test]
    async fn test_boot_schedules_init() {
        let mut emu = emulator(SchedulingPolicy::Priority);
        assert_eq!(emu.current(), Some(Pid::INIT));
        assert_eq!(
            emu.scheduler().metrics(Pid::INIT).unwrap().class,
            ProcessClass::System
        );
        assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Getpid, &[]).await.value, 1);
    }

    #[tokio::test]
    async fn test_non_current_gets_eagain() {
        let mut emu = emulator(SchedulingPolicy::Priority);
        let child = Pid(call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await.value as u32);
        assert!(emu.scheduler().contains(child));
        let ret = call(&mut emu, child, SyscallNr::Getpid, &[]).await;
        assert_eq!(ret.errno, Some(Errno::EAGAIN));
    }

    #[tokio::test]
    async fn test_exit_leaves_scheduler() {
        let mut emu = emulator(SchedulingPolicy::Cfs);
        let child = Pid(call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await.value as u32);
        assert!(emu.run_until_current(child, 1.0, 100.0));
        call(&mut emu, child, SyscallNr::Exit, &[3]).await;
        assert!(!emu.scheduler().contains(child));
        assert_eq!(emu.current(), Some(Pid::INIT));
    }

    #[tokio::test]
    async fn test_tick_charges_cpu() {
        let mut emu = emulator(SchedulingPolicy::Priority);
        emu.tick(7.0);
        assert_eq!(emu.kernel().process(Pid::INIT).unwrap().cpu_time, 7.0);
        assert_eq!(emu.scheduler().metrics(Pid::INIT).unwrap().vruntime, 7.0);
        assert_eq!(emu.now(), 7.0);
    }

    #[tokio::test]
    async fn test_stop_and_continue_track_runnable() {
        let mut emu = emulator(SchedulingPolicy::Priority);
        let child = Pid(call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await.value as u32);
        call(&mut emu, Pid::INIT, SyscallNr::Kill, &[child.0 as u64, 19]).await;
        assert!(!emu.scheduler().metrics(child).unwrap().runnable);
        call(&mut emu, Pid::INIT, SyscallNr::Kill, &[child.0 as u64, 18]).await;
        assert!(emu.scheduler().metrics(child).unwrap().runnable);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = EmulatorConfig::default();
        config.scheduler.cores = 0;
        assert!(matches!(Emulator::boot(config), Err(EmulatorError::Config(_))));
    }
}
