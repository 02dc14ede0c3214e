//! System call interface
//!
//! This is the boundary between guest code and the kernel. Guests issue
//! `(pid, nr, args)` with Linux x86-64 numbering; `Kernel::syscall`
//! decodes the raw arguments, marshals pointer arguments through the
//! caller's linear memory and calls the typed `sys_*` handlers, which live
//! next to the state they touch (`fs.rs`, `proc.rs`).
//!
//! Handlers never panic on guest input. Every failure is an `Errno`,
//! reported to the guest as `-1` plus the code.

use super::abi::{StatBuf, Timespec, Timeval};
use super::errno::{Errno, SyscallResult};
use super::files::{Devices, OpenFileTable};
use super::network::{NetworkStack, encode_sockaddr_in, parse_sockaddr_in};
use super::process::{Fd, OpenFlags, Pid, VirtualProcess};
use super::signal::Disposition;
use super::wasm::ProgramLoader;
use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::vfs::{MemoryFs, Metadata, PATH_MAX};
use bytemuck::Pod;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

// ========== SYSCALL NUMBERS ==========

/// Syscall numbers, as on Linux x86-64
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u32)]
pub enum SyscallNr {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Stat = 4,
    Fstat = 5,
    Lstat = 6,
    Lseek = 8,
    Mmap = 9,
    Mprotect = 10,
    Munmap = 11,
    Brk = 12,
    RtSigaction = 13,
    Dup = 32,
    Getpid = 39,
    Socket = 41,
    Connect = 42,
    Accept = 43,
    Bind = 49,
    Listen = 50,
    Clone = 56,
    Fork = 57,
    Execve = 59,
    Exit = 60,
    Wait4 = 61,
    Kill = 62,
    Getcwd = 79,
    Chdir = 80,
    Mkdir = 83,
    Rmdir = 84,
    Unlink = 87,
    Symlink = 88,
    Readlink = 89,
    Gettimeofday = 96,
    Getuid = 102,
    Getgid = 104,
    Getppid = 110,
    Gettid = 186,
    Time = 201,
    Futex = 202,
    ClockGettime = 228,
    ExitGroup = 231,
}

impl SyscallNr {
    pub const ALL: [SyscallNr; 42] = [
        SyscallNr::Read,
        SyscallNr::Write,
        SyscallNr::Open,
        SyscallNr::Close,
        SyscallNr::Stat,
        SyscallNr::Fstat,
        SyscallNr::Lstat,
        SyscallNr::Lseek,
        SyscallNr::Mmap,
        SyscallNr::Mprotect,
        SyscallNr::Munmap,
        SyscallNr::Brk,
        SyscallNr::RtSigaction,
        SyscallNr::Dup,
        SyscallNr::Getpid,
        SyscallNr::Socket,
        SyscallNr::Connect,
        SyscallNr::Accept,
        SyscallNr::Bind,
        SyscallNr::Listen,
        SyscallNr::Clone,
        SyscallNr::Fork,
        SyscallNr::Execve,
        SyscallNr::Exit,
        SyscallNr::Wait4,
        SyscallNr::Kill,
        SyscallNr::Getcwd,
        SyscallNr::Chdir,
        SyscallNr::Mkdir,
        SyscallNr::Rmdir,
        SyscallNr::Unlink,
        SyscallNr::Symlink,
        SyscallNr::Readlink,
        SyscallNr::Gettimeofday,
        SyscallNr::Getuid,
        SyscallNr::Getgid,
        SyscallNr::Getppid,
        SyscallNr::Gettid,
        SyscallNr::Time,
        SyscallNr::Futex,
        SyscallNr::ClockGettime,
        SyscallNr::ExitGroup,
    ];

    pub fn from_num(n: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|nr| nr.num() == n)
    }

    /// Get the syscall name (for tracing/debugging)
    pub fn name(&self) -> &'static str {
        match self {
            SyscallNr::Read => "read",
            SyscallNr::Write => "write",
            SyscallNr::Open => "open",
            SyscallNr::Close => "close",
            SyscallNr::Stat => "stat",
            SyscallNr::Fstat => "fstat",
            SyscallNr::Lstat => "lstat",
            SyscallNr::Lseek => "lseek",
            SyscallNr::Mmap => "mmap",
            SyscallNr::Mprotect => "mprotect",
            SyscallNr::Munmap => "munmap",
            SyscallNr::Brk => "brk",
            SyscallNr::RtSigaction => "rt_sigaction",
            SyscallNr::Dup => "dup",
            SyscallNr::Getpid => "getpid",
            SyscallNr::Socket => "socket",
            SyscallNr::Connect => "connect",
            SyscallNr::Accept => "accept",
            SyscallNr::Bind => "bind",
            SyscallNr::Listen => "listen",
            SyscallNr::Clone => "clone",
            SyscallNr::Fork => "fork",
            SyscallNr::Execve => "execve",
            SyscallNr::Exit => "exit",
            SyscallNr::Wait4 => "wait4",
            SyscallNr::Kill => "kill",
            SyscallNr::Getcwd => "getcwd",
            SyscallNr::Chdir => "chdir",
            SyscallNr::Mkdir => "mkdir",
            SyscallNr::Rmdir => "rmdir",
            SyscallNr::Unlink => "unlink",
            SyscallNr::Symlink => "symlink",
            SyscallNr::Readlink => "readlink",
            SyscallNr::Gettimeofday => "gettimeofday",
            SyscallNr::Getuid => "getuid",
            SyscallNr::Getgid => "getgid",
            SyscallNr::Getppid => "getppid",
            SyscallNr::Gettid => "gettid",
            SyscallNr::Time => "time",
            SyscallNr::Futex => "futex",
            SyscallNr::ClockGettime => "clock_gettime",
            SyscallNr::ExitGroup => "exit_group",
        }
    }

    /// Get the syscall number
    pub fn num(&self) -> u32 {
        *self as u32
    }
}

impl std::fmt::Display for SyscallNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.num())
    }
}

/// Human-readable name for a raw syscall number
pub fn syscall_name(nr: u32) -> &'static str {
    SyscallNr::from_num(nr).map_or("unknown", |n| n.name())
}

// ========== ARGUMENTS AND RESULTS ==========

/// Raw syscall arguments, one machine word each
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct SyscallArgs(pub [u64; 6]);

impl SyscallArgs {
    /// Build from up to six words; missing words are zero
    pub fn new(words: &[u64]) -> Self {
        let mut args = [0u64; 6];
        for (slot, word) in args.iter_mut().zip(words) {
            *slot = *word;
        }
        Self(args)
    }

    pub fn get(&self, i: usize) -> u64 {
        self.0.get(i).copied().unwrap_or(0)
    }

    pub fn u32(&self, i: usize) -> u32 {
        self.get(i) as u32
    }

    pub fn i32(&self, i: usize) -> i32 {
        self.get(i) as i32
    }

    pub fn i64(&self, i: usize) -> i64 {
        self.get(i) as i64
    }

    pub fn usize(&self, i: usize) -> usize {
        self.get(i) as usize
    }

    pub fn fd(&self, i: usize) -> Fd {
        Fd(self.u32(i))
    }
}

/// What the guest sees: a value, or -1 and an errno
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyscallReturn {
    pub value: i64,
    pub errno: Option<Errno>,
}

impl SyscallReturn {
    pub fn ok(value: i64) -> Self {
        Self { value, errno: None }
    }

    pub fn err(errno: Errno) -> Self {
        Self {
            value: -1,
            errno: Some(errno),
        }
    }

    pub fn is_error(&self) -> bool {
        self.errno.is_some()
    }
}

impl From<SyscallResult<i64>> for SyscallReturn {
    fn from(result: SyscallResult<i64>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(errno) => Self::err(errno),
        }
    }
}

/// Bytes a syscall copied into guest memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestWrite {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

/// Process lifecycle changes, drained by the host to keep the scheduler in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KernelEvent {
    Spawned { pid: Pid, parent: Pid },
    Execed { pid: Pid },
    Exited { pid: Pid, code: i32 },
    Reaped { pid: Pid },
    Stopped { pid: Pid },
    Continued { pid: Pid },
    /// Every thread is parked on a futex
    Blocked { pid: Pid },
    Woken { pid: Pid },
}

/// Longest argv/envp vector accepted by execve
const MAX_EXEC_STRINGS: usize = 1024;

// ========== KERNEL ==========

/// The kernel state - owns the filesystem, process table and open files
pub struct Kernel {
    pub(super) config: KernelConfig,
    pub(super) processes: BTreeMap<Pid, VirtualProcess>,
    /// Next pid (and tid) to allocate; never reused
    pub(super) next_pid: u32,
    pub(super) files: OpenFileTable,
    pub(super) devices: Devices,
    pub(super) network: NetworkStack,
    pub(super) vfs: MemoryFs,
    pub(super) loader: Box<dyn ProgramLoader>,
    pub(super) clock: Arc<dyn Clock>,
    /// Parked threads per (pid, futex word)
    pub(super) futexes: HashMap<(Pid, u64), VecDeque<u32>>,
    pub(super) events: Vec<KernelEvent>,
    /// Guest memory writes made by the syscall in progress
    guest_writes: Vec<GuestWrite>,
}

impl Kernel {
    /// An empty kernel with no filesystem layout and no processes;
    /// `Kernel::boot` is the usual constructor
    pub fn new(config: KernelConfig, clock: Arc<dyn Clock>, loader: Box<dyn ProgramLoader>) -> Self {
        let seed = clock.now_ms().to_bits() ^ 0x9E37_79B9_7F4A_7C15;
        Self {
            config,
            processes: BTreeMap::new(),
            next_pid: 1,
            files: OpenFileTable::new(),
            devices: Devices::new(seed),
            network: NetworkStack::new(),
            vfs: MemoryFs::new(),
            loader,
            clock,
            futexes: HashMap::new(),
            events: Vec::new(),
            guest_writes: Vec::new(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn vfs(&self) -> &MemoryFs {
        &self.vfs
    }

    pub fn vfs_mut(&mut self) -> &mut MemoryFs {
        self.vfs.set_clock(self.clock.now_ms());
        &mut self.vfs
    }

    pub fn network(&self) -> &NetworkStack {
        &self.network
    }

    pub fn open_files(&self) -> &OpenFileTable {
        &self.files
    }

    pub fn now(&self) -> f64 {
        self.clock.now_ms()
    }

    pub fn process(&self, pid: Pid) -> Option<&VirtualProcess> {
        self.processes.get(&pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut VirtualProcess> {
        self.processes.get_mut(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &VirtualProcess> {
        self.processes.values()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Drain lifecycle events since the last call
    pub fn take_events(&mut self) -> Vec<KernelEvent> {
        std::mem::take(&mut self.events)
    }

    // ========== HOST SURFACE ==========

    /// Queue bytes for /dev/stdin
    pub fn push_stdin(&mut self, data: &[u8]) {
        self.devices.push_stdin(data);
    }

    pub fn take_stdout(&mut self) -> Vec<u8> {
        self.devices.take_stdout()
    }

    pub fn take_stderr(&mut self) -> Vec<u8> {
        self.devices.take_stderr()
    }

    /// Charge cpu time to a process
    pub fn charge_cpu(&mut self, pid: Pid, ms: f64) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.cpu_time += ms.max(0.0);
        }
    }

    /// Record a host-side AI operation (model call) made for `pid`
    pub fn record_ai_op(&mut self, pid: Pid) {
        if let Some(process) = self.processes.get_mut(&pid) {
            process.behavior.ai_ops += 1;
        }
    }

    /// Copy bytes into a process's memory on the host's behalf
    pub fn write_guest(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> SyscallResult<()> {
        let process = self.processes.get_mut(&pid).ok_or(Errno::ESRCH)?;
        process.instance.memory.write(addr, bytes)?;
        Ok(())
    }

    pub fn read_guest(&self, pid: Pid, addr: u64, len: usize) -> SyscallResult<Vec<u8>> {
        let process = self.processes.get(&pid).ok_or(Errno::ESRCH)?;
        Ok(process.instance.memory.read(addr, len)?.to_vec())
    }

    /// Guest writes made by the most recent `syscall`
    pub fn take_guest_writes(&mut self) -> Vec<GuestWrite> {
        std::mem::take(&mut self.guest_writes)
    }

    // ========== INTERNAL HELPERS ==========

    pub(super) fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub(super) fn live(&self, pid: Pid) -> SyscallResult<&VirtualProcess> {
        self.processes
            .get(&pid)
            .filter(|p| p.is_alive())
            .ok_or(Errno::ESRCH)
    }

    pub(super) fn live_mut(&mut self, pid: Pid) -> SyscallResult<&mut VirtualProcess> {
        self.processes
            .get_mut(&pid)
            .filter(|p| p.is_alive())
            .ok_or(Errno::ESRCH)
    }

    /// Read a path argument
    fn read_path(&self, pid: Pid, addr: u64) -> SyscallResult<String> {
        let memory = &self.live(pid)?.instance.memory;
        match memory.read_cstring(addr, PATH_MAX + 1) {
            Ok(path) if path.is_empty() => Err(Errno::ENOENT),
            Ok(path) => Ok(path),
            // A full window without a terminator is an over-long path
            Err(_) if memory.read(addr, PATH_MAX + 1).is_ok() => Err(Errno::ENAMETOOLONG),
            Err(err) => Err(err.into()),
        }
    }

    fn read_bytes(&self, pid: Pid, addr: u64, len: usize) -> SyscallResult<Vec<u8>> {
        Ok(self.live(pid)?.instance.memory.read(addr, len)?.to_vec())
    }

    fn read_pod<T: Pod>(&self, pid: Pid, addr: u64) -> SyscallResult<T> {
        Ok(self.live(pid)?.instance.memory.read_pod(addr)?)
    }

    /// Copy bytes out to the guest, remembering them for cache replay
    fn copy_out(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> SyscallResult<()> {
        self.live_mut(pid)?.instance.memory.write(addr, bytes)?;
        self.guest_writes.push(GuestWrite {
            addr,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn copy_out_pod<T: Pod>(&mut self, pid: Pid, addr: u64, value: &T) -> SyscallResult<()> {
        self.copy_out(pid, addr, bytemuck::bytes_of(value))
    }

    /// Read a NULL-terminated array of 32-bit string pointers
    fn read_string_vec(&self, pid: Pid, addr: u64) -> SyscallResult<Vec<String>> {
        let mut out = Vec::new();
        if addr == 0 {
            return Ok(out);
        }
        let memory = &self.live(pid)?.instance.memory;
        for i in 0..=MAX_EXEC_STRINGS {
            let ptr = memory.read_u32(addr + 4 * i as u64)?;
            if ptr == 0 {
                return Ok(out);
            }
            out.push(memory.read_cstring(ptr as u64, PATH_MAX)?);
        }
        Err(Errno::EINVAL)
    }

    /// Bytes for a cache key that the raw arguments don't capture: the
    /// path string behind a pointer argument
    pub fn cache_key_extra(&self, pid: Pid, nr: u32, args: &SyscallArgs) -> Option<Vec<u8>> {
        match SyscallNr::from_num(nr)? {
            SyscallNr::Stat | SyscallNr::Lstat => {
                self.read_path(pid, args.get(0)).ok().map(String::into_bytes)
            }
            _ => None,
        }
    }

    fn stat_buf(meta: &Metadata) -> StatBuf {
        StatBuf {
            st_ino: meta.ino,
            st_mode: meta.st_mode(),
            st_nlink: meta.nlink,
            st_uid: meta.uid,
            st_gid: meta.gid,
            st_size: meta.size,
            st_atime_ms: meta.atime as i64,
            st_mtime_ms: meta.mtime as i64,
            st_ctime_ms: meta.ctime as i64,
        }
    }

    /// Track what the process spends its syscalls on, for classification
    fn note_behavior(&mut self, pid: Pid, nr: SyscallNr, args: &SyscallArgs) {
        let stdin_read = nr == SyscallNr::Read && self.is_stdin(pid, args.fd(0));
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        process.behavior.syscalls += 1;
        match nr {
            SyscallNr::Read
            | SyscallNr::Write
            | SyscallNr::Socket
            | SyscallNr::Connect
            | SyscallNr::Accept => process.behavior.io_ops += 1,
            _ => {}
        }
        if stdin_read {
            process.behavior.interactions += 1;
        }
    }

    fn sample_memory(&mut self, pid: Pid) {
        if let Some(process) = self.processes.get_mut(&pid) {
            let total = process.address_space.total_bytes();
            process.behavior.sample_memory(total);
        }
    }

    // ========== ABI ENTRY POINT ==========

    /// Execute a raw syscall for `pid`
    pub fn syscall(&mut self, pid: Pid, nr: u32, args: &SyscallArgs) -> SyscallReturn {
        self.guest_writes.clear();
        self.vfs.set_clock(self.clock.now_ms());

        let Some(nr) = SyscallNr::from_num(nr) else {
            tracing::debug!(%pid, nr, "unknown syscall");
            return SyscallReturn::err(Errno::ENOSYS);
        };
        if self.live(pid).is_err() {
            return SyscallReturn::err(Errno::ESRCH);
        }
        self.note_behavior(pid, nr, args);

        let result = self.dispatch_abi(pid, nr, args);
        if matches!(nr, SyscallNr::Brk | SyscallNr::Mmap | SyscallNr::Munmap) {
            self.sample_memory(pid);
        }
        result.into()
    }

    fn dispatch_abi(&mut self, pid: Pid, nr: SyscallNr, args: &SyscallArgs) -> SyscallResult<i64> {
        match nr {
            // File I/O
            SyscallNr::Read => {
                let len = args.usize(2);
                // Fault before consuming any input
                self.live(pid)?.instance.memory.read(args.get(1), len)?;
                let mut buf = vec![0u8; len];
                let n = self.sys_read(pid, args.fd(0), &mut buf)?;
                self.copy_out(pid, args.get(1), &buf[..n])?;
                Ok(n as i64)
            }
            SyscallNr::Write => {
                let data = self.read_bytes(pid, args.get(1), args.usize(2))?;
                Ok(self.sys_write(pid, args.fd(0), &data)? as i64)
            }
            SyscallNr::Open => {
                let path = self.read_path(pid, args.get(0))?;
                let flags = OpenFlags::from_bits(args.u32(1));
                let fd = self.sys_open(pid, &path, flags, args.u32(2) as u16)?;
                Ok(fd.0 as i64)
            }
            SyscallNr::Close => self.sys_close(pid, args.fd(0)).map(|_| 0),
            SyscallNr::Lseek => Ok(self.sys_lseek(pid, args.fd(0), args.i64(1), args.u32(2))? as i64),
            SyscallNr::Dup => Ok(self.sys_dup(pid, args.fd(0))?.0 as i64),

            // Status
            SyscallNr::Stat | SyscallNr::Lstat => {
                let path = self.read_path(pid, args.get(0))?;
                let meta = if nr == SyscallNr::Stat {
                    self.sys_stat(pid, &path)?
                } else {
                    self.sys_lstat(pid, &path)?
                };
                self.copy_out_pod(pid, args.get(1), &Self::stat_buf(&meta))?;
                Ok(0)
            }
            SyscallNr::Fstat => {
                let meta = self.sys_fstat(pid, args.fd(0))?;
                self.copy_out_pod(pid, args.get(1), &Self::stat_buf(&meta))?;
                Ok(0)
            }

            // Filesystem
            SyscallNr::Getcwd => {
                let cwd = self.sys_getcwd(pid)?;
                let mut bytes = cwd.into_bytes();
                bytes.push(0);
                if bytes.len() > args.usize(1) {
                    return Err(Errno::EINVAL);
                }
                self.copy_out(pid, args.get(0), &bytes)?;
                Ok(bytes.len() as i64)
            }
            SyscallNr::Chdir => {
                let path = self.read_path(pid, args.get(0))?;
                self.sys_chdir(pid, &path).map(|_| 0)
            }
            SyscallNr::Mkdir => {
                let path = self.read_path(pid, args.get(0))?;
                self.sys_mkdir(pid, &path, args.u32(1) as u16).map(|_| 0)
            }
            SyscallNr::Rmdir => {
                let path = self.read_path(pid, args.get(0))?;
                self.sys_rmdir(pid, &path).map(|_| 0)
            }
            SyscallNr::Unlink => {
                let path = self.read_path(pid, args.get(0))?;
                self.sys_unlink(pid, &path).map(|_| 0)
            }
            SyscallNr::Symlink => {
                let target = self.read_path(pid, args.get(0))?;
                let link = self.read_path(pid, args.get(1))?;
                self.sys_symlink(pid, &target, &link).map(|_| 0)
            }
            SyscallNr::Readlink => {
                let path = self.read_path(pid, args.get(0))?;
                let target = self.sys_readlink(pid, &path)?;
                let n = target.len().min(args.usize(2));
                self.copy_out(pid, args.get(1), &target.as_bytes()[..n])?;
                Ok(n as i64)
            }

            // Memory
            SyscallNr::Brk => Ok(self.sys_brk(pid, args.get(0))? as i64),
            SyscallNr::Mmap => {
                let addr = self.sys_mmap(
                    pid,
                    args.get(0),
                    args.get(1),
                    args.u32(2),
                    args.u32(3),
                    args.i32(4),
                )?;
                Ok(addr as i64)
            }
            SyscallNr::Munmap => self.sys_munmap(pid, args.get(0), args.get(1)).map(|_| 0),
            SyscallNr::Mprotect => self
                .sys_mprotect(pid, args.get(0), args.get(1), args.u32(2))
                .map(|_| 0),

            // Process lifecycle
            SyscallNr::Getpid => Ok(self.sys_getpid(pid)?.0 as i64),
            SyscallNr::Getppid => Ok(self.sys_getppid(pid)? as i64),
            SyscallNr::Gettid => Ok(self.sys_gettid(pid)? as i64),
            SyscallNr::Getuid => Ok(self.sys_getuid(pid)? as i64),
            SyscallNr::Getgid => Ok(self.sys_getgid(pid)? as i64),
            SyscallNr::Fork => Ok(self.sys_fork(pid)?.0 as i64),
            SyscallNr::Clone => Ok(self.sys_clone(pid, args.get(0), args.get(1))? as i64),
            SyscallNr::Execve => {
                let path = self.read_path(pid, args.get(0))?;
                let argv = self.read_string_vec(pid, args.get(1))?;
                let envp = self.read_string_vec(pid, args.get(2))?;
                self.sys_execve(pid, &path, argv, envp).map(|_| 0)
            }
            SyscallNr::Exit | SyscallNr::ExitGroup => {
                self.sys_exit(pid, args.i32(0))?;
                Ok(0)
            }
            SyscallNr::Wait4 => match self.sys_wait4(pid, args.i32(0), args.u32(2))? {
                Some((child, status)) => {
                    if args.get(1) != 0 {
                        self.copy_out_pod(pid, args.get(1), &status)?;
                    }
                    Ok(child.0 as i64)
                }
                None => Ok(0),
            },

            // Signals
            SyscallNr::Kill => self.sys_kill(pid, args.i32(0), args.u32(1)).map(|_| 0),
            SyscallNr::RtSigaction => {
                let new = match args.get(1) {
                    0 => None,
                    ptr => Some(Disposition::from_raw(self.read_pod::<u64>(pid, ptr)?)),
                };
                let old = self.sys_rt_sigaction(pid, args.u32(0), new)?;
                if args.get(2) != 0 {
                    self.copy_out_pod(pid, args.get(2), &old.to_raw())?;
                }
                Ok(0)
            }
            SyscallNr::Futex => {
                let uaddr = args.get(0);
                let op = args.u32(1) & !super::abi::futex::FUTEX_PRIVATE_FLAG;
                let val = args.u32(2);
                match op {
                    super::abi::futex::FUTEX_WAIT => {
                        let word = self.read_pod::<u32>(pid, uaddr)?;
                        self.sys_futex_wait(pid, uaddr, word, val).map(|_| 0)
                    }
                    super::abi::futex::FUTEX_WAKE => Ok(self.sys_futex_wake(pid, uaddr, val)? as i64),
                    _ => Err(Errno::ENOSYS),
                }
            }

            // Time
            SyscallNr::Time => {
                let secs = self.sys_time(pid)?;
                if args.get(0) != 0 {
                    self.copy_out_pod(pid, args.get(0), &secs)?;
                }
                Ok(secs)
            }
            SyscallNr::Gettimeofday => {
                let tv: Timeval = self.sys_gettimeofday(pid)?;
                self.copy_out_pod(pid, args.get(0), &tv)?;
                Ok(0)
            }
            SyscallNr::ClockGettime => {
                let ts: Timespec = self.sys_clock_gettime(pid, args.u32(0))?;
                self.copy_out_pod(pid, args.get(1), &ts)?;
                Ok(0)
            }

            // Sockets
            SyscallNr::Socket => {
                Ok(self.sys_socket(pid, args.u32(0), args.u32(1), args.u32(2))?.0 as i64)
            }
            SyscallNr::Bind | SyscallNr::Connect => {
                let len = args.usize(2);
                let raw = self.read_bytes(pid, args.get(1), len)?;
                let addr = parse_sockaddr_in(&raw)?;
                if nr == SyscallNr::Bind {
                    self.sys_bind(pid, args.fd(0), addr)?;
                } else {
                    self.sys_connect(pid, args.fd(0), addr)?;
                }
                Ok(0)
            }
            SyscallNr::Listen => self.sys_listen(pid, args.fd(0), args.usize(1)).map(|_| 0),
            SyscallNr::Accept => {
                let (fd, peer) = self.sys_accept(pid, args.fd(0))?;
                if let Some(peer) = peer.filter(|_| args.get(1) != 0) {
                    let encoded = encode_sockaddr_in(&peer);
                    self.copy_out(pid, args.get(1), &encoded)?;
                    if args.get(2) != 0 {
                        self.copy_out_pod(pid, args.get(2), &(encoded.len() as u32))?;
                    }
                }
                Ok(fd.0 as i64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_match_linux() {
        assert_eq!(SyscallNr::Read.num(), 0);
        assert_eq!(SyscallNr::Execve.num(), 59);
        assert_eq!(SyscallNr::ClockGettime.num(), 228);
        assert_eq!(SyscallNr::from_num(61), Some(SyscallNr::Wait4));
        assert_eq!(SyscallNr::from_num(7), None);
    }

    #[test]
    fn test_all_table_is_consistent() {
        for nr in SyscallNr::ALL {
            assert_eq!(SyscallNr::from_num(nr.num()), Some(nr));
        }
        assert_eq!(SyscallNr::Fork.to_string(), "fork(57)");
        assert_eq!(syscall_name(9999), "unknown");
    }

    #[test]
    fn test_args_accessors() {
        let args = SyscallArgs::new(&[u64::MAX, 3]);
        assert_eq!(args.i32(0), -1);
        assert_eq!(args.fd(1), Fd(3));
        assert_eq!(args.get(5), 0);
    }

    #[test]
    fn test_return_from_result() {
        assert_eq!(SyscallReturn::from(Ok(4)), SyscallReturn::ok(4));
        let err = SyscallReturn::from(Err(Errno::EBADF));
        assert_eq!(err.value, -1);
        assert_eq!(err.errno, Some(Errno::EBADF));
    }
}
