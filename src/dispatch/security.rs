//! Security hook and risk scoring
//!
//! The security hook asks a `RiskScorer` how dangerous a call is and
//! refuses High and Critical verdicts with EPERM. It is tagged
//! `HookKind::Security`, so a scorer that errors, panics or times out
//! also ends in EPERM.

use super::SyscallContext;
use super::hooks::{HookAction, HookError, HookKind, ProcessIdentity, SyscallHook};
use crate::kernel::abi::mman::{PROT_EXEC, PROT_WRITE};
use crate::kernel::{Errno, Pid, Signal, SyscallArgs, SyscallNr};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Risk verdict, ordered from harmless to critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and Critical are hard blocks
    pub fn is_blocking(self) -> bool {
        self >= Severity::High
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScorerError {
    #[error("risk scorer unavailable: {0}")]
    Unavailable(String),

    #[error("risk scorer rejected request: {0}")]
    Rejected(String),
}

impl From<ScorerError> for HookError {
    fn from(err: ScorerError) -> Self {
        HookError::Failed(err.to_string())
    }
}

/// Input to a risk scorer
#[derive(Debug, Clone, Serialize)]
pub struct RiskQuery {
    pub nr: u32,
    pub pid: Pid,
    pub args: SyscallArgs,
    pub caller: ProcessIdentity,
}

/// External collaborator that grades syscalls
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait RiskScorer: Send + Sync {
    async fn score(&self, query: &RiskQuery) -> Result<Severity, ScorerError>;
}

/// Default scorer: fixed rules over the call and the caller's identity
///
/// Built-in rules:
/// - a non-root caller signalling init: Critical
/// - kill with pid <= 0 (process groups, broadcast): High
/// - writable and executable mappings: Medium
///
/// Per-syscall floors added with `with_rule` are combined with these by
/// taking the maximum.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedScorer {
    floors: HashMap<u32, Severity>,
}

impl RuleBasedScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grade every call of `nr` at least `severity`
    pub fn with_rule(mut self, nr: SyscallNr, severity: Severity) -> Self {
        self.floors.insert(nr.num(), severity);
        self
    }

    /// The verdict, without the async wrapper
    pub fn evaluate(&self, query: &RiskQuery) -> Severity {
        let floor = self.floors.get(&query.nr).copied().unwrap_or(Severity::None);
        floor.max(Self::builtin(query))
    }

    fn builtin(query: &RiskQuery) -> Severity {
        let args = &query.args;
        match SyscallNr::from_num(query.nr) {
            Some(SyscallNr::Kill) => {
                let target = args.i32(0);
                let sig = args.u32(1);
                if target <= 0 {
                    Severity::High
                } else if target == Pid::INIT.0 as i32 && query.caller.uid != 0 && sig != 0 {
                    Severity::Critical
                } else if sig == Signal::SIGKILL.num() {
                    Severity::Low
                } else {
                    Severity::None
                }
            }
            Some(SyscallNr::Mmap) | Some(SyscallNr::Mprotect) => {
                let prot = args.u32(2);
                if prot & PROT_WRITE != 0 && prot & PROT_EXEC != 0 {
                    Severity::Medium
                } else {
                    Severity::None
                }
            }
            Some(SyscallNr::Execve) if query.caller.uid != 0 => Severity::Low,
            _ => Severity::None,
        }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl RiskScorer for RuleBasedScorer {
    async fn score(&self, query: &RiskQuery) -> Result<Severity, ScorerError> {
        Ok(self.evaluate(query))
    }
}

/// Pre-hook that enforces risk verdicts
pub struct SecurityHook {
    scorer: Arc<dyn RiskScorer>,
    priority: i32,
}

impl SecurityHook {
    /// Runs before every other default-priority hook
    pub const DEFAULT_PRIORITY: i32 = 1000;

    pub fn new(scorer: Arc<dyn RiskScorer>) -> Self {
        Self {
            scorer,
            priority: Self::DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl SyscallHook for SecurityHook {
    fn name(&self) -> &str {
        "security"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn kind(&self) -> HookKind {
        HookKind::Security
    }

    async fn before_syscall(
        &self,
        ctx: &SyscallContext,
        caller: &ProcessIdentity,
    ) -> Result<HookAction, HookError> {
        let query = RiskQuery {
            nr: ctx.nr,
            pid: ctx.pid,
            args: ctx.args,
            caller: caller.clone(),
        };
        let severity = self.scorer.score(&query).await?;
        if severity.is_blocking() {
            tracing::warn!(
                pid = %ctx.pid,
                syscall = crate::kernel::syscall_name(ctx.nr),
                %severity,
                "syscall blocked by risk verdict"
            );
            return Ok(HookAction::deny(Errno::EPERM));
        }
        Ok(HookAction::Continue)
    }
}
