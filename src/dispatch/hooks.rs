//! Syscall hooks
//!
//! Hooks run around the kernel handler. Pre-hooks may let the call
//! through, abort it with a chosen return, or rewrite its arguments;
//! post-hooks only observe. Every invocation races an independent timer.
//! A hook that loses the race is dropped mid-flight, so a late verdict can
//! never be applied.

use super::SyscallContext;
use crate::kernel::{Errno, Pid, SyscallArgs};
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use serde::Serialize;
use thiserror::Error;

/// What a pre-hook decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Skip the handler and return this to the guest
    Abort { value: i64, errno: Errno },
    /// Run the rest of the pipeline with these arguments
    Modify { args: SyscallArgs },
}

impl HookAction {
    /// The usual abort: -1 with `errno`
    pub fn deny(errno: Errno) -> Self {
        HookAction::Abort { value: -1, errno }
    }
}

/// How the dispatcher treats a hook that fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HookKind {
    /// Fails open: a fault counts as Continue
    General,
    /// Fails closed: a fault aborts with EPERM
    Security,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(String),

    #[error("hook `{hook}` timed out after {timeout_ms}ms")]
    Timeout { hook: String, timeout_ms: u64 },

    #[error("hook `{hook}` panicked")]
    Panicked { hook: String },
}

/// Who is making the call, as seen by hooks and risk scorers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessIdentity {
    pub pid: Pid,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub command: String,
}

impl ProcessIdentity {
    /// Identity for a pid the handler doesn't know
    pub fn unknown(pid: Pid) -> Self {
        Self {
            pid,
            ppid: 0,
            uid: u32::MAX,
            gid: u32::MAX,
            command: String::new(),
        }
    }
}

/// A hook in the dispatch pipeline
///
/// Hooks run in descending `priority` order; ties keep registration order.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait SyscallHook: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn kind(&self) -> HookKind {
        HookKind::General
    }

    async fn before_syscall(
        &self,
        _ctx: &SyscallContext,
        _caller: &ProcessIdentity,
    ) -> Result<HookAction, HookError> {
        Ok(HookAction::Continue)
    }

    async fn after_syscall(&self, _ctx: &SyscallContext) -> Result<(), HookError> {
        Ok(())
    }
}

// ========== TIMER ==========

/// Source of hook deadlines
///
/// Natively this is tokio's timer (virtual under a paused test runtime);
/// in the browser it is a `setTimeout`-backed promise on the window or
/// the worker scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookTimer;

impl HookTimer {
    #[cfg(not(target_arch = "wasm32"))]
    pub fn sleep(&self, ms: u64) -> LocalBoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(std::time::Duration::from_millis(ms)))
    }

    #[cfg(target_arch = "wasm32")]
    pub fn sleep(&self, ms: u64) -> LocalBoxFuture<'static, ()> {
        let timeout = i32::try_from(ms).unwrap_or(i32::MAX);
        let promise = js_sys::Promise::new(&mut |resolve, _reject| {
            arm_or_fire(
                || set_timeout(&resolve, timeout),
                || {
                    let _ = resolve.call0(&wasm_bindgen::JsValue::NULL);
                },
            );
        });
        Box::pin(async move {
            let _ = wasm_bindgen_futures::JsFuture::from(promise).await;
        })
    }
}

/// `setTimeout` on whichever global is available: the window on a page,
/// the worker scope inside a Web Worker
#[cfg(target_arch = "wasm32")]
fn set_timeout(callback: &js_sys::Function, timeout: i32) -> Result<(), wasm_bindgen::JsValue> {
    use wasm_bindgen::JsCast;

    if let Some(window) = web_sys::window() {
        return window
            .set_timeout_with_callback_and_timeout_and_arguments_0(callback, timeout)
            .map(drop);
    }
    let scope: web_sys::WorkerGlobalScope = js_sys::global().dyn_into()?;
    scope
        .set_timeout_with_callback_and_timeout_and_arguments_0(callback, timeout)
        .map(drop)
}

/// Arm a deadline timer. When none can be armed the deadline fires at
/// once, so the hook is treated as timed out rather than left unbounded.
#[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
fn arm_or_fire<E: std::fmt::Debug>(arm: impl FnOnce() -> Result<(), E>, fire: impl FnOnce()) -> bool {
    match arm() {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(?err, "no timer available, hook deadline expires immediately");
            fire();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passive;

    #[async_trait]
    impl SyscallHook for Passive {
        fn name(&self) -> &str {
            "passive"
        }
    }

    #[test]
    fn test_unarmed_timer_fires_at_once() {
        let mut fired = false;
        assert!(!arm_or_fire(|| Err("no global scope"), || fired = true));
        assert!(fired);

        let mut fired = false;
        assert!(arm_or_fire(|| Ok::<(), &str>(()), || fired = true));
        assert!(!fired);
    }

    #[tokio::test]
    async fn test_default_hook_continues() {
        let ctx = SyscallContext::new(Pid(1), 39, SyscallArgs::default(), 0.0);
        let action = Passive
            .before_syscall(&ctx, &ProcessIdentity::unknown(Pid(1)))
            .await
            .unwrap();
        assert_eq!(action, HookAction::Continue);
        assert!(Passive.after_syscall(&ctx).await.is_ok());
        assert_eq!(Passive.kind(), HookKind::General);
        assert_eq!(Passive.priority(), 0);
    }

    #[test]
    fn test_deny() {
        assert_eq!(
            HookAction::deny(Errno::EPERM),
            HookAction::Abort {
                value: -1,
                errno: Errno::EPERM
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_elapses_in_virtual_time() {
        let start = tokio::time::Instant::now();
        HookTimer.sleep(250).await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(250));
    }
}
