//! The kernel - process table, VFS-backed file I/O and the syscall ABI
//!
//! Small, auditable core:
//! - One owned `Kernel` value per emulator; no globals
//! - Handlers are synchronous and mutate through `&mut self`
//! - Guest-visible failures are `Errno` values, never panics

pub mod abi;
pub mod errno;
pub mod files;
mod fs;
pub mod init;
pub mod memory;
pub mod network;
mod proc;
pub mod process;
pub mod signal;
pub mod syscall;
pub mod wasm;

#[cfg(test)]
mod invariants_test;

pub use errno::{Errno, SyscallResult};
pub use files::{Handle, OpenFileTable, OpenObject};
pub use init::INIT_PATH;
pub use memory::{AddressSpace, MemoryError, MemoryStats};
pub use network::{NetworkStack, SocketId, SocketState, SocketType};
pub use process::{
    BehaviorCounters, Fd, OpenFlags, Pid, ProcessState, ThreadState, VirtualProcess, VirtualThread,
};
pub use signal::{Disposition, Signal};
pub use syscall::{GuestWrite, Kernel, KernelEvent, SyscallArgs, SyscallNr, SyscallReturn, syscall_name};
pub use wasm::{LinearMemory, LoadError, ProgramImage, ProgramLoader, ValidatingLoader, WasmInstance};
