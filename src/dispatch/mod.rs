//! Syscall dispatch pipeline
//!
//! Every guest syscall enters through `Dispatcher::dispatch`:
//!
//! 1. cache check (allow-listed idempotent calls only)
//! 2. pre-hooks, highest priority first
//! 3. the handler (normally the `Kernel`)
//! 4. post-hooks
//! 5. cache update and invalidation
//! 6. statistics and audit
//!
//! Each hook invocation races its own timer. A hook that loses the race
//! is dropped, so its verdict is never applied. On native hosts panics in
//! hooks or in the handler are caught here and never reach the caller.
//! wasm32-unknown-unknown aborts on panic, so in the browser a panic still
//! takes the module down; there `catch_unwind` is a no-op.

pub mod audit;
pub mod cache;
pub mod hooks;
pub mod profiling;
pub mod security;
pub mod stats;

pub use audit::{AuditLog, DEFAULT_AUDIT_CAPACITY};
pub use cache::{CacheClass, CacheKey, SyscallCache};
pub use hooks::{HookAction, HookError, HookKind, HookTimer, ProcessIdentity, SyscallHook};
pub use profiling::{ProcessProfile, ProfilingHook};
pub use security::{RiskQuery, RiskScorer, RuleBasedScorer, ScorerError, SecurityHook, Severity};
pub use stats::{DispatchStats, DispatcherMetrics, PerfCounters};

use crate::clock::Clock;
use crate::config::DispatcherConfig;
use crate::kernel::{Errno, GuestWrite, Kernel, Pid, SyscallArgs, SyscallReturn, syscall_name};
use futures::FutureExt;
use futures::future::{Either, select};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// One dispatched syscall, as seen by hooks and recorded in the audit log
#[derive(Debug, Clone, Serialize)]
pub struct SyscallContext {
    pub pid: Pid,
    pub nr: u32,
    /// Arguments as finally executed (after any Modify)
    pub args: SyscallArgs,
    pub return_value: i64,
    pub errno: Option<Errno>,
    /// Emulator time at entry (ms)
    pub timestamp: f64,
    pub duration_ms: f64,
    /// Served from the result cache
    pub cached: bool,
    /// Aborted by a pre-hook
    pub blocked: bool,
}

impl SyscallContext {
    pub fn new(pid: Pid, nr: u32, args: SyscallArgs, timestamp: f64) -> Self {
        Self {
            pid,
            nr,
            args,
            return_value: 0,
            errno: None,
            timestamp,
            duration_ms: 0.0,
            cached: false,
            blocked: false,
        }
    }

    fn complete(&mut self, result: SyscallReturn, duration_ms: f64) {
        self.return_value = result.value;
        self.errno = result.errno;
        self.duration_ms = duration_ms;
    }

    pub fn result(&self) -> SyscallReturn {
        SyscallReturn {
            value: self.return_value,
            errno: self.errno,
        }
    }
}

// ========== HANDLER ==========

/// What the dispatcher wraps
///
/// The kernel is the production handler; tests substitute counting or
/// faulting handlers.
pub trait SyscallHandler {
    fn handle(&mut self, pid: Pid, nr: u32, args: &SyscallArgs) -> SyscallReturn;

    /// Guest memory the last `handle` wrote, kept with cached results
    fn take_guest_writes(&mut self) -> Vec<GuestWrite> {
        Vec::new()
    }

    /// Re-apply writes recorded by an earlier call (cache hit)
    fn replay_guest_writes(&mut self, _pid: Pid, _writes: &[GuestWrite]) {}

    /// Pointer-argument contents that belong in the cache key
    fn cache_key_extra(&self, _pid: Pid, _nr: u32, _args: &SyscallArgs) -> Option<Vec<u8>> {
        None
    }

    fn identity(&self, _pid: Pid) -> Option<ProcessIdentity> {
        None
    }
}

impl SyscallHandler for Kernel {
    fn handle(&mut self, pid: Pid, nr: u32, args: &SyscallArgs) -> SyscallReturn {
        self.syscall(pid, nr, args)
    }

    fn take_guest_writes(&mut self) -> Vec<GuestWrite> {
        Kernel::take_guest_writes(self)
    }

    fn replay_guest_writes(&mut self, pid: Pid, writes: &[GuestWrite]) {
        for write in writes {
            if let Err(errno) = self.write_guest(pid, write.addr, &write.bytes) {
                tracing::debug!(%pid, addr = write.addr, %errno, "cached write not replayed");
            }
        }
    }

    fn cache_key_extra(&self, pid: Pid, nr: u32, args: &SyscallArgs) -> Option<Vec<u8>> {
        Kernel::cache_key_extra(self, pid, nr, args)
    }

    fn identity(&self, pid: Pid) -> Option<ProcessIdentity> {
        self.process(pid).map(|p| ProcessIdentity {
            pid: p.pid,
            ppid: p.ppid,
            uid: p.uid,
            gid: p.gid,
            command: p.command.clone(),
        })
    }
}

enum PreHookOutcome {
    Proceed { modified: bool },
    Aborted(SyscallReturn),
}

// ========== DISPATCHER ==========

pub struct Dispatcher<H = Kernel> {
    handler: H,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    /// Sorted by descending priority; ties keep registration order
    hooks: Vec<Arc<dyn SyscallHook>>,
    cache: SyscallCache,
    stats: DispatchStats,
    audit: AuditLog,
    timer: HookTimer,
    started_at: f64,
}

impl<H: SyscallHandler> Dispatcher<H> {
    pub fn new(handler: H, config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now_ms();
        Self {
            handler,
            cache: SyscallCache::new(&config),
            audit: AuditLog::new(config.audit_capacity),
            config,
            clock,
            hooks: Vec::new(),
            stats: DispatchStats::new(),
            timer: HookTimer,
            started_at,
        }
    }

    pub fn register_hook(&mut self, hook: Arc<dyn SyscallHook>) {
        tracing::debug!(hook = hook.name(), priority = hook.priority(), "hook registered");
        self.hooks.push(hook);
        self.hooks.sort_by_key(|h| std::cmp::Reverse(h.priority()));
    }

    /// Remove every hook with this name; returns whether one was found
    pub fn remove_hook(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name() != name);
        self.hooks.len() != before
    }

    /// Hook names in execution order
    pub fn hook_names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        self.stats.metrics(self.clock.now_ms() - self.started_at)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn cache(&self) -> &SyscallCache {
        &self.cache
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Forget cached results of a process (it exited or was reaped)
    pub fn invalidate_pid(&mut self, pid: Pid) {
        self.cache.invalidate_pid(pid);
    }

    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.config.cache_enabled = enabled;
        if !enabled {
            self.cache.clear();
        }
    }

    pub fn set_audit_enabled(&mut self, enabled: bool) {
        self.config.audit_enabled = enabled;
    }

    /// Run one syscall through the pipeline
    pub async fn dispatch(&mut self, pid: Pid, nr: u32, args: SyscallArgs) -> SyscallReturn {
        let started = self.clock.now_ms();
        let mut ctx = SyscallContext::new(pid, nr, args, started);

        // 1. Cache
        let cache_key = self.cache_key(pid, nr, &args);
        if let Some(key) = &cache_key {
            let hit = self
                .cache
                .get(key, started)
                .map(|entry| (entry.result, entry.writes.clone()));
            match hit {
                Some((result, writes)) => {
                    self.handler.replay_guest_writes(pid, &writes);
                    self.stats.cache_hits += 1;
                    ctx.cached = true;
                    ctx.complete(result, 0.0);
                    self.finish(&ctx);
                    return result;
                }
                None => self.stats.cache_misses += 1,
            }
        }

        // 2. Pre-hooks
        let identity = self
            .handler
            .identity(pid)
            .unwrap_or_else(|| ProcessIdentity::unknown(pid));
        let modified = match self.run_pre_hooks(&mut ctx, &identity).await {
            PreHookOutcome::Proceed { modified } => modified,
            PreHookOutcome::Aborted(result) => {
                ctx.blocked = true;
                ctx.complete(result, self.clock.now_ms() - started);
                self.finish(&ctx);
                return result;
            }
        };

        // 3. Handler
        let result = self.run_handler(pid, nr, &ctx.args);
        let writes = self.handler.take_guest_writes();
        ctx.complete(result, self.clock.now_ms() - started);

        // 4. Post-hooks
        self.run_post_hooks(&ctx).await;

        // 5. Cache
        if let Some(key) = cache_key.filter(|_| !modified && !result.is_error()) {
            self.cache.insert(key, result, writes, self.clock.now_ms());
        }
        if !result.is_error() {
            self.invalidate_after(pid, nr);
        }

        // 6. Stats and audit
        self.finish(&ctx);
        result
    }

    fn cache_key(&self, pid: Pid, nr: u32, args: &SyscallArgs) -> Option<CacheKey> {
        if !self.config.cache_enabled || self.cache.ttl_for(nr).is_none() {
            return None;
        }
        Some(CacheKey {
            pid,
            nr,
            args: *args,
            extra: self.handler.cache_key_extra(pid, nr, args),
        })
    }

    async fn run_pre_hooks(&mut self, ctx: &mut SyscallContext, identity: &ProcessIdentity) -> PreHookOutcome {
        let hooks = self.hooks.clone();
        let timeout_ms = self.config.hook_timeout_ms;
        let mut modified = false;

        for hook in hooks {
            let verdict = {
                let call = AssertUnwindSafe(hook.before_syscall(ctx, identity)).catch_unwind();
                match select(Box::pin(call), self.timer.sleep(timeout_ms)).await {
                    Either::Left((Ok(verdict), _)) => verdict,
                    Either::Left((Err(_), _)) => Err(HookError::Panicked {
                        hook: hook.name().to_string(),
                    }),
                    Either::Right(_) => Err(HookError::Timeout {
                        hook: hook.name().to_string(),
                        timeout_ms,
                    }),
                }
            };

            match verdict {
                Ok(HookAction::Continue) => {}
                Ok(HookAction::Modify { args }) => {
                    tracing::trace!(hook = hook.name(), pid = %ctx.pid, "arguments rewritten");
                    ctx.args = args;
                    modified = true;
                }
                Ok(HookAction::Abort { value, errno }) => {
                    match hook.kind() {
                        HookKind::Security => self.stats.security_blocks += 1,
                        HookKind::General => self.stats.hook_aborts += 1,
                    }
                    return PreHookOutcome::Aborted(SyscallReturn {
                        value,
                        errno: Some(errno),
                    });
                }
                Err(err) => {
                    self.count_hook_fault(&err);
                    tracing::warn!(
                        hook = hook.name(),
                        pid = %ctx.pid,
                        syscall = syscall_name(ctx.nr),
                        error = %err,
                        "pre-hook fault"
                    );
                    if hook.kind() == HookKind::Security {
                        self.stats.security_blocks += 1;
                        return PreHookOutcome::Aborted(SyscallReturn::err(Errno::EPERM));
                    }
                }
            }
        }
        PreHookOutcome::Proceed { modified }
    }

    fn run_handler(&mut self, pid: Pid, nr: u32, args: &SyscallArgs) -> SyscallReturn {
        let handler = &mut self.handler;
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(pid, nr, args))) {
            Ok(result) => result,
            Err(_) => {
                self.stats.internal_faults += 1;
                tracing::error!(%pid, syscall = syscall_name(nr), nr, "syscall handler panicked");
                SyscallReturn::err(Errno::EIO)
            }
        }
    }

    async fn run_post_hooks(&mut self, ctx: &SyscallContext) {
        let hooks = self.hooks.clone();
        let timeout_ms = self.config.hook_timeout_ms;

        for hook in hooks {
            let outcome = {
                let call = AssertUnwindSafe(hook.after_syscall(ctx)).catch_unwind();
                match select(Box::pin(call), self.timer.sleep(timeout_ms)).await {
                    Either::Left((Ok(outcome), _)) => outcome,
                    Either::Left((Err(_), _)) => Err(HookError::Panicked {
                        hook: hook.name().to_string(),
                    }),
                    Either::Right(_) => Err(HookError::Timeout {
                        hook: hook.name().to_string(),
                        timeout_ms,
                    }),
                }
            };
            if let Err(err) = outcome {
                self.count_hook_fault(&err);
                tracing::warn!(hook = hook.name(), pid = %ctx.pid, error = %err, "post-hook fault");
            }
        }
    }

    fn count_hook_fault(&mut self, err: &HookError) {
        match err {
            HookError::Timeout { .. } => self.stats.hook_timeouts += 1,
            HookError::Failed(_) | HookError::Panicked { .. } => self.stats.hook_failures += 1,
        }
    }

    fn invalidate_after(&mut self, pid: Pid, nr: u32) {
        if cache::invalidates_file_stats(nr) {
            self.cache.invalidate_class(CacheClass::FileStat);
        }
        if cache::invalidates_identity(nr) {
            self.cache.invalidate_class(CacheClass::Identity);
            if matches!(
                crate::kernel::SyscallNr::from_num(nr),
                Some(crate::kernel::SyscallNr::Exit | crate::kernel::SyscallNr::ExitGroup)
            ) {
                self.cache.invalidate_pid(pid);
            }
        }
    }

    fn finish(&mut self, ctx: &SyscallContext) {
        self.stats.record(ctx.nr, ctx.duration_ms, ctx.errno.is_some());
        if self.config.audit_enabled {
            self.audit.push(ctx.clone());
        }
    }
}
