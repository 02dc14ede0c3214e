//! Signal System
//!
//! Per-process signal dispositions and the pending queue. Numbers follow
//! Linux x86-64 so guests compiled against a real libc agree with the
//! kernel about what `kill(pid, 15)` means.
//!
//! The kernel asks `SignalTable::deliver` what a signal should do; the
//! table never touches process state itself.

use super::errno::{Errno, SyscallResult};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
    SIGCHLD = 17,
    SIGCONT = 18,
    SIGSTOP = 19,
}

impl Signal {
    /// Get signal from number
    pub fn from_num(n: u32) -> Option<Signal> {
        match n {
            1 => Some(Signal::SIGHUP),
            2 => Some(Signal::SIGINT),
            3 => Some(Signal::SIGQUIT),
            9 => Some(Signal::SIGKILL),
            10 => Some(Signal::SIGUSR1),
            12 => Some(Signal::SIGUSR2),
            13 => Some(Signal::SIGPIPE),
            14 => Some(Signal::SIGALRM),
            15 => Some(Signal::SIGTERM),
            17 => Some(Signal::SIGCHLD),
            18 => Some(Signal::SIGCONT),
            19 => Some(Signal::SIGSTOP),
            _ => None,
        }
    }

    pub fn num(&self) -> u32 {
        *self as u32
    }

    /// SIGKILL and SIGSTOP cannot be caught or ignored
    pub fn can_catch(&self) -> bool {
        !matches!(self, Signal::SIGKILL | Signal::SIGSTOP)
    }

    fn default_delivery(&self) -> Delivery {
        match self {
            Signal::SIGCHLD => Delivery::Ignore,
            Signal::SIGSTOP => Delivery::Stop,
            Signal::SIGCONT => Delivery::Continue,
            _ => Delivery::Terminate,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a process disposes of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Disposition {
    Default,
    Ignore,
    /// Guest handler at this address
    Handler(u64),
}

impl Disposition {
    /// Decode an `rt_sigaction` handler word (SIG_DFL = 0, SIG_IGN = 1)
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Disposition::Default,
            1 => Disposition::Ignore,
            addr => Disposition::Handler(addr),
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            Disposition::Default => 0,
            Disposition::Ignore => 1,
            Disposition::Handler(addr) => addr,
        }
    }
}

/// Outcome of delivering a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Terminate with exit code 128 + signo
    Terminate,
    Stop,
    Continue,
    Ignore,
    /// Queued for the guest handler
    Pending,
}

/// A process's signal state
#[derive(Debug, Clone, Default)]
pub struct SignalTable {
    dispositions: HashMap<Signal, Disposition>,
    pending: VecDeque<Signal>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disposition(&self, signal: Signal) -> Disposition {
        self.dispositions
            .get(&signal)
            .copied()
            .unwrap_or(Disposition::Default)
    }

    /// Install a disposition, returning the previous one
    pub fn set_disposition(&mut self, signal: Signal, disposition: Disposition) -> SyscallResult<Disposition> {
        if !signal.can_catch() && disposition != Disposition::Default {
            return Err(Errno::EINVAL);
        }
        let old = self.disposition(signal);
        if disposition == Disposition::Default {
            self.dispositions.remove(&signal);
        } else {
            self.dispositions.insert(signal, disposition);
        }
        Ok(old)
    }

    /// Decide what `signal` does to this process
    pub fn deliver(&mut self, signal: Signal) -> Delivery {
        match signal {
            Signal::SIGKILL => Delivery::Terminate,
            Signal::SIGSTOP => Delivery::Stop,
            // SIGCONT always resumes; a handler additionally sees it
            Signal::SIGCONT => {
                if let Disposition::Handler(_) = self.disposition(signal) {
                    self.queue(signal);
                }
                Delivery::Continue
            }
            _ => match self.disposition(signal) {
                Disposition::Default => signal.default_delivery(),
                Disposition::Ignore => Delivery::Ignore,
                Disposition::Handler(_) => {
                    self.queue(signal);
                    Delivery::Pending
                }
            },
        }
    }

    /// Standard signals don't queue: a second instance coalesces
    fn queue(&mut self, signal: Signal) {
        if !self.pending.contains(&signal) {
            self.pending.push_back(signal);
        }
    }

    pub fn next_pending(&mut self) -> Option<Signal> {
        self.pending.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Child of fork: same dispositions, nothing pending
    pub fn fork(&self) -> Self {
        Self {
            dispositions: self.dispositions.clone(),
            pending: VecDeque::new(),
        }
    }

    /// After exec, handlers point into the old image and are reset;
    /// ignored signals stay ignored
    pub fn reset_for_exec(&mut self) {
        self.dispositions.retain(|_, d| *d == Disposition::Ignore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_numbers() {
        assert_eq!(Signal::SIGKILL.num(), 9);
        assert_eq!(Signal::from_num(15), Some(Signal::SIGTERM));
        assert_eq!(Signal::from_num(0), None);
        assert_eq!(Signal::SIGTERM.to_string(), "SIGTERM");
    }

    #[test]
    fn test_cannot_catch_kill_or_stop() {
        let mut table = SignalTable::new();
        assert_eq!(
            table.set_disposition(Signal::SIGKILL, Disposition::Handler(0x1000)),
            Err(Errno::EINVAL)
        );
        assert_eq!(
            table.set_disposition(Signal::SIGSTOP, Disposition::Ignore),
            Err(Errno::EINVAL)
        );
        assert_eq!(table.deliver(Signal::SIGKILL), Delivery::Terminate);
    }

    #[test]
    fn test_handler_makes_signal_pending() {
        let mut table = SignalTable::new();
        let old = table
            .set_disposition(Signal::SIGTERM, Disposition::Handler(0x2000))
            .unwrap();
        assert_eq!(old, Disposition::Default);

        assert_eq!(table.deliver(Signal::SIGTERM), Delivery::Pending);
        assert_eq!(table.deliver(Signal::SIGTERM), Delivery::Pending);
        assert_eq!(table.pending_count(), 1);
        assert_eq!(table.next_pending(), Some(Signal::SIGTERM));
        assert!(!table.has_pending());
    }

    #[test]
    fn test_defaults() {
        let mut table = SignalTable::new();
        assert_eq!(table.deliver(Signal::SIGTERM), Delivery::Terminate);
        assert_eq!(table.deliver(Signal::SIGCHLD), Delivery::Ignore);
        assert_eq!(table.deliver(Signal::SIGSTOP), Delivery::Stop);
        assert_eq!(table.deliver(Signal::SIGCONT), Delivery::Continue);

        table.set_disposition(Signal::SIGINT, Disposition::Ignore).unwrap();
        assert_eq!(table.deliver(Signal::SIGINT), Delivery::Ignore);
    }

    #[test]
    fn test_exec_resets_handlers_keeps_ignore() {
        let mut table = SignalTable::new();
        table.set_disposition(Signal::SIGUSR1, Disposition::Handler(0x10)).unwrap();
        table.set_disposition(Signal::SIGHUP, Disposition::Ignore).unwrap();
        table.reset_for_exec();
        assert_eq!(table.disposition(Signal::SIGUSR1), Disposition::Default);
        assert_eq!(table.disposition(Signal::SIGHUP), Disposition::Ignore);
    }

    #[test]
    fn test_fork_drops_pending() {
        let mut table = SignalTable::new();
        table.set_disposition(Signal::SIGUSR2, Disposition::Handler(0x10)).unwrap();
        table.deliver(Signal::SIGUSR2);
        let child = table.fork();
        assert!(!child.has_pending());
        assert_eq!(child.disposition(Signal::SIGUSR2), Disposition::Handler(0x10));
    }
}
