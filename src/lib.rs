//! guestos - guest-process kernel emulation for a browser-hosted OS
//!
//! Guest programs (WASM modules) run on the host and talk to this crate
//! through Linux-numbered syscalls. The pieces:
//! - `kernel`: in-memory VFS, process table, descriptors, sockets, memory
//!   bookkeeping and the syscall handlers
//! - `dispatch`: the pipeline around the kernel (hooks, security, result
//!   cache, statistics, audit)
//! - `sched`: classification and the multi-policy scheduler
//! - `emulator`: ties the three together behind one control path
//!
//! Platform support:
//! - Browser (wasm32-unknown-unknown): `wasm::GuestOs` handle
//! - Native: the `guestos` CLI and the test suite

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod emulator;
pub mod kernel;
pub mod sched;
pub mod vfs;

#[cfg(target_arch = "wasm32")]
pub mod wasm;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, DispatcherConfig, EmulatorConfig, KernelConfig, SchedulerConfig};
pub use dispatch::{Dispatcher, SyscallContext, SyscallHandler};
pub use emulator::{Emulator, EmulatorError, EmulatorMetrics};
pub use kernel::{Errno, Kernel, Pid, SyscallArgs, SyscallNr, SyscallReturn};
pub use sched::{PriorityTier, ProcessClass, Scheduler, SchedulingPolicy};
