//! Process abstraction
//!
//! A process owns its descriptor table, WASM instance, address space,
//! signal table and threads. Nothing here is shared between processes
//! except the open-file handles the descriptor table points at.
//!
//! Lifecycle: Running <-> {Sleeping, Stopped}; Running -> Zombie on exit;
//! Zombie -> Dead when reaped. Dead is terminal.

use super::abi::open;
use super::files::Handle;
use super::memory::AddressSpace;
use super::signal::SignalTable;
use super::wasm::WasmInstance;
use serde::Serialize;
use std::collections::HashMap;

/// Process identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pid(pub u32);

impl Pid {
    /// The bootstrap process
    pub const INIT: Pid = Pid(1);
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Running,
    Sleeping,
    Stopped,
    /// Exited, waiting to be reaped by its parent
    Zombie(i32),
    /// Reaped
    Dead,
}

/// File descriptor - an index into a process's file table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(pub u32);

impl Fd {
    pub const STDIN: Fd = Fd(0);
    pub const STDOUT: Fd = Fd(1);
    pub const STDERR: Fd = Fd(2);
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Decoded `open` flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
    pub directory: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        create: false,
        exclusive: false,
        truncate: false,
        append: false,
        directory: false,
    };

    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: true,
        exclusive: false,
        truncate: true,
        append: false,
        directory: false,
    };

    pub const RDWR: OpenFlags = OpenFlags {
        read: true,
        write: true,
        create: false,
        exclusive: false,
        truncate: false,
        append: false,
        directory: false,
    };

    /// Decode Linux `O_*` bits
    pub fn from_bits(bits: u32) -> Self {
        let (read, write) = match bits & open::O_ACCMODE {
            open::O_WRONLY => (false, true),
            open::O_RDWR => (true, true),
            _ => (true, false),
        };
        Self {
            read,
            write,
            create: bits & open::O_CREAT != 0,
            exclusive: bits & open::O_EXCL != 0,
            truncate: bits & open::O_TRUNC != 0,
            append: bits & open::O_APPEND != 0,
            directory: bits & open::O_DIRECTORY != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = match (self.read, self.write) {
            (true, true) => open::O_RDWR,
            (false, true) => open::O_WRONLY,
            _ => open::O_RDONLY,
        };
        for (set, flag) in [
            (self.create, open::O_CREAT),
            (self.exclusive, open::O_EXCL),
            (self.truncate, open::O_TRUNC),
            (self.append, open::O_APPEND),
            (self.directory, open::O_DIRECTORY),
        ] {
            if set {
                bits |= flag;
            }
        }
        bits
    }
}

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    Runnable,
    /// Parked on a futex word
    FutexWait(u32),
    Exited,
}

/// A thread, exclusively owned by its process
#[derive(Debug, Clone)]
pub struct VirtualThread {
    /// Thread id, drawn from the pid space
    pub tid: u32,
    pub pid: Pid,
    pub state: ThreadState,
    pub stack_base: u64,
    pub stack_size: u64,
    /// Register snapshot saved at the last context switch
    pub registers: [u64; 16],
    /// Blocked signals, bit n-1 for signal n
    pub signal_mask: u64,
}

impl VirtualThread {
    pub fn new(tid: u32, pid: Pid, stack_base: u64, stack_size: u64) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Runnable,
            stack_base,
            stack_size,
            registers: [0; 16],
            signal_mask: 0,
        }
    }
}

/// Counters the kernel keeps per process for scheduling classification
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BehaviorCounters {
    pub syscalls: u64,
    /// read/write/socket traffic
    pub io_ops: u64,
    /// Reads from the terminal (user interaction)
    pub interactions: u64,
    /// Host-reported AI operations (model calls)
    pub ai_ops: u64,
    /// Mapped bytes sampled after each brk/mmap/munmap
    pub memory_samples: Vec<u64>,
}

/// Maximum memory samples kept per process
const MAX_MEMORY_SAMPLES: usize = 32;

impl BehaviorCounters {
    pub fn sample_memory(&mut self, mapped: u64) {
        if self.memory_samples.len() == MAX_MEMORY_SAMPLES {
            self.memory_samples.remove(0);
        }
        self.memory_samples.push(mapped);
    }
}

/// A guest process
pub struct VirtualProcess {
    pub pid: Pid,
    /// Parent pid; 0 for init
    pub ppid: u32,
    pub command: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub state: ProcessState,
    pub instance: WasmInstance,
    pub files: FileTable,
    pub signals: SignalTable,
    pub threads: Vec<VirtualThread>,
    /// Thread the host is currently running; syscalls act on its behalf
    pub active_tid: u32,
    pub address_space: AddressSpace,
    pub start_time: f64,
    /// Accumulated cpu time in ms, charged by the host
    pub cpu_time: f64,
    pub exit_code: Option<i32>,
    pub children: Vec<Pid>,
    pub behavior: BehaviorCounters,
}

impl VirtualProcess {
    /// Create a process whose main thread shares its pid
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pid: Pid,
        ppid: u32,
        command: String,
        argv: Vec<String>,
        env: Vec<String>,
        uid: u32,
        gid: u32,
        instance: WasmInstance,
        max_fds: usize,
        memory_limit: u64,
        now: f64,
    ) -> Self {
        let address_space = AddressSpace::new(memory_limit);
        let main_thread = VirtualThread::new(
            pid.0,
            pid,
            address_space.stack_top() - super::memory::STACK_SIZE,
            super::memory::STACK_SIZE,
        );
        Self {
            pid,
            ppid,
            command,
            argv,
            env,
            cwd: "/".to_string(),
            uid,
            gid,
            state: ProcessState::Running,
            instance,
            files: FileTable::with_limit(max_fds),
            signals: SignalTable::new(),
            threads: vec![main_thread],
            active_tid: pid.0,
            address_space,
            start_time: now,
            cpu_time: 0.0,
            exit_code: None,
            children: Vec::new(),
            behavior: BehaviorCounters::default(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Zombie(_) | ProcessState::Dead)
    }

    pub fn can_run(&self) -> bool {
        matches!(self.state, ProcessState::Running)
    }

    pub fn thread(&self, tid: u32) -> Option<&VirtualThread> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub fn thread_mut(&mut self, tid: u32) -> Option<&mut VirtualThread> {
        self.threads.iter_mut().find(|t| t.tid == tid)
    }

    /// Whether every live thread is parked on a futex
    pub fn all_threads_waiting(&self) -> bool {
        let mut live = self.threads.iter().filter(|t| t.state != ThreadState::Exited).peekable();
        live.peek().is_some() && live.all(|t| matches!(t.state, ThreadState::FutexWait(_)))
    }

    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(key, _)| *key == name)
                .map(|(_, value)| value)
        })
    }
}

/// Maximum file descriptors per process (POSIX default is often 1024)
pub const MAX_FDS_PER_PROCESS: usize = 1024;

/// A process's file descriptor table
///
/// Descriptors are allocated monotonically and never reused within the
/// process, so a stale fd can never alias a newer open file.
#[derive(Debug, Clone)]
pub struct FileTable {
    /// Next fd to allocate
    next_fd: u32,
    /// Map from fd to open-file handle
    table: HashMap<Fd, Handle>,
    max_fds: usize,
}

impl FileTable {
    pub fn new() -> Self {
        Self::with_limit(MAX_FDS_PER_PROCESS)
    }

    pub fn with_limit(max_fds: usize) -> Self {
        Self {
            next_fd: 3, // 0, 1, 2 reserved for stdin/stdout/stderr
            table: HashMap::new(),
            max_fds,
        }
    }

    /// Allocate a new file descriptor for a handle
    /// Returns None if the fd limit has been reached
    pub fn alloc(&mut self, handle: Handle) -> Option<Fd> {
        if self.table.len() >= self.max_fds {
            return None;
        }
        let fd = Fd(self.next_fd);
        self.next_fd += 1;
        self.table.insert(fd, handle);
        Some(fd)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn max_fds(&self) -> usize {
        self.max_fds
    }

    pub fn insert(&mut self, fd: Fd, handle: Handle) {
        self.table.insert(fd, handle);
    }

    pub fn get(&self, fd: Fd) -> Option<Handle> {
        self.table.get(&fd).copied()
    }

    pub fn remove(&mut self, fd: Fd) -> Option<Handle> {
        self.table.remove(&fd)
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.table.contains_key(&fd)
    }

    /// Remove every descriptor, returning the handles to release
    pub fn drain(&mut self) -> Vec<Handle> {
        self.table.drain().map(|(_, h)| h).collect()
    }

    /// Clone the table for fork: same fds, same handles, same fd limit.
    /// The caller must retain each handle in the open-file table.
    pub fn clone_for_fork(&self) -> Self {
        self.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fd, Handle)> + '_ {
        self.table.iter().map(|(fd, h)| (*fd, *h))
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
