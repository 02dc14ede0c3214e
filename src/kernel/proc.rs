//! Process, memory, signal, futex and time syscalls

use super::abi::{self, Timespec, Timeval, clone::CLONE_THREAD, mman::MAP_ANONYMOUS, wait::WNOHANG};
use super::errno::{Errno, SyscallResult};
use super::memory::{AddressSpace, STACK_SIZE};
use super::process::{Pid, ProcessState, ThreadState, VirtualProcess, VirtualThread};
use super::signal::{Delivery, Disposition, Signal};
use super::syscall::{Kernel, KernelEvent};
use super::wasm::WasmInstance;
use crate::vfs::{Access, NodeKind};

impl Kernel {
    // ========== IDENTITY ==========

    pub(super) fn sys_getpid(&mut self, pid: Pid) -> SyscallResult<Pid> {
        Ok(self.live(pid)?.pid)
    }

    pub(super) fn sys_getppid(&mut self, pid: Pid) -> SyscallResult<u32> {
        Ok(self.live(pid)?.ppid)
    }

    pub(super) fn sys_gettid(&mut self, pid: Pid) -> SyscallResult<u32> {
        Ok(self.live(pid)?.active_tid)
    }

    pub(super) fn sys_getuid(&mut self, pid: Pid) -> SyscallResult<u32> {
        Ok(self.live(pid)?.uid)
    }

    pub(super) fn sys_getgid(&mut self, pid: Pid) -> SyscallResult<u32> {
        Ok(self.live(pid)?.gid)
    }

    // ========== LIFECYCLE ==========

    /// Duplicate the caller. The child shares every open-file handle with
    /// the parent and starts with a copy-on-write view of its memory.
    pub(super) fn sys_fork(&mut self, pid: Pid) -> SyscallResult<Pid> {
        if self.processes.len() >= self.config.max_processes {
            tracing::warn!(%pid, limit = self.config.max_processes, "fork: process table full");
            return Err(Errno::ENOMEM);
        }
        self.live(pid)?;
        let child_pid = self.alloc_pid();
        let now = self.now();

        let parent = self.live(pid)?;
        let mut thread = parent
            .thread(parent.active_tid)
            .cloned()
            .unwrap_or_else(|| VirtualThread::new(child_pid.0, child_pid, 0, STACK_SIZE));
        thread.tid = child_pid.0;
        thread.pid = child_pid;
        thread.state = ThreadState::Runnable;

        let child = VirtualProcess {
            pid: child_pid,
            ppid: pid.0,
            command: parent.command.clone(),
            argv: parent.argv.clone(),
            env: parent.env.clone(),
            cwd: parent.cwd.clone(),
            uid: parent.uid,
            gid: parent.gid,
            state: ProcessState::Running,
            instance: parent.instance.fork(),
            files: parent.files.clone_for_fork(),
            signals: parent.signals.fork(),
            threads: vec![thread],
            active_tid: child_pid.0,
            address_space: parent.address_space.clone(),
            start_time: now,
            cpu_time: 0.0,
            exit_code: None,
            children: Vec::new(),
            behavior: Default::default(),
        };

        for (_, handle) in child.files.iter() {
            self.files.retain(handle);
        }
        self.processes.insert(child_pid, child);
        if let Some(parent) = self.processes.get_mut(&pid) {
            parent.children.push(child_pid);
        }
        self.events.push(KernelEvent::Spawned {
            pid: child_pid,
            parent: pid,
        });
        tracing::debug!(parent = %pid, child = %child_pid, "fork");
        Ok(child_pid)
    }

    /// CLONE_THREAD adds a thread to the caller; anything else is a fork
    pub(super) fn sys_clone(&mut self, pid: Pid, flags: u64, stack: u64) -> SyscallResult<u32> {
        if flags & CLONE_THREAD == 0 {
            return self.sys_fork(pid).map(|child| child.0);
        }
        if stack == 0 {
            return Err(Errno::EINVAL);
        }
        self.live(pid)?;
        let tid = self.alloc_pid().0;
        let process = self.live_mut(pid)?;
        let base = stack.saturating_sub(STACK_SIZE);
        process.threads.push(VirtualThread::new(tid, pid, base, STACK_SIZE));
        tracing::debug!(%pid, tid, "clone thread");
        Ok(tid)
    }

    /// Replace the caller's image in place. The pid, cwd, credentials and
    /// descriptors survive; handlers, threads and memory do not.
    pub(super) fn sys_execve(&mut self, pid: Pid, path: &str, argv: Vec<String>, env: Vec<String>) -> SyscallResult<()> {
        let (cwd, uid, gid) = {
            let process = self.live(pid)?;
            (process.cwd.clone(), process.uid, process.gid)
        };
        let resolved = self.vfs.resolve_as(&cwd, path, true, uid, gid)?;
        let node = self.vfs.node(&resolved).ok_or(Errno::ENOENT)?;
        if !matches!(node.kind, NodeKind::File(_)) || !node.permits(uid, gid, Access::EXECUTE) {
            return Err(Errno::EACCES);
        }
        let bytes = self.vfs.read_file(&resolved)?;
        let image = self.loader.load(&resolved, &bytes).map_err(|err| {
            tracing::debug!(%pid, path = %resolved, error = %err, "execve: rejected image");
            Errno::from(err)
        })?;

        let memory_size = self.config.linear_memory_size;
        let memory_limit = self.config.memory_limit;
        let process = self.live_mut(pid)?;
        let mut main = VirtualThread::new(pid.0, pid, 0, STACK_SIZE);
        let address_space = AddressSpace::new(memory_limit);
        main.stack_base = address_space.stack_top() - STACK_SIZE;

        process.command = resolved;
        process.argv = argv;
        process.env = env;
        process.instance = WasmInstance::from_image(image, memory_size);
        process.address_space = address_space;
        process.signals.reset_for_exec();
        process.threads = vec![main];
        process.active_tid = pid.0;
        process.state = ProcessState::Running;

        self.futexes.retain(|(owner, _), _| *owner != pid);
        self.events.push(KernelEvent::Execed { pid });
        tracing::debug!(%pid, command = %path, "execve");
        Ok(())
    }

    /// Terminate the caller: Zombie(code), descriptors released, children
    /// handed to init. The parent collects the status with wait4.
    pub(super) fn sys_exit(&mut self, pid: Pid, code: i32) -> SyscallResult<()> {
        let process = self.live_mut(pid)?;
        process.state = ProcessState::Zombie(code);
        process.exit_code = Some(code);
        for thread in &mut process.threads {
            thread.state = ThreadState::Exited;
        }
        let handles = process.files.drain();
        let orphans = std::mem::take(&mut process.children);
        let ppid = Pid(process.ppid);

        for handle in handles {
            self.release_handle(handle);
        }

        let new_parent = if pid == Pid::INIT { 0 } else { Pid::INIT.0 };
        for orphan in &orphans {
            if let Some(child) = self.processes.get_mut(orphan) {
                child.ppid = new_parent;
            }
        }
        if new_parent != 0 {
            if let Some(init) = self.processes.get_mut(&Pid::INIT) {
                init.children.extend(orphans);
            }
        }

        if let Some(parent) = self.processes.get_mut(&ppid).filter(|p| p.is_alive()) {
            parent.signals.deliver(Signal::SIGCHLD);
        }
        self.futexes.retain(|(owner, _), _| *owner != pid);
        self.events.push(KernelEvent::Exited { pid, code });
        tracing::debug!(%pid, code, "exit");
        Ok(())
    }

    /// Reap a zombie child: -1 means any child. Returns None under WNOHANG
    /// when children exist but none has exited.
    pub(super) fn sys_wait4(&mut self, pid: Pid, target: i32, options: u32) -> SyscallResult<Option<(Pid, u32)>> {
        let children = &self.live(pid)?.children;
        let candidates: Vec<Pid> = match target {
            -1 => children.clone(),
            t if t > 0 => children.iter().copied().filter(|c| c.0 == t as u32).collect(),
            // Process groups are not modelled
            _ => return Err(Errno::EINVAL),
        };
        if candidates.is_empty() {
            return Err(Errno::ECHILD);
        }

        let reaped = candidates.into_iter().find_map(|child| match self.processes.get(&child)?.state {
            ProcessState::Zombie(code) => Some((child, code)),
            _ => None,
        });
        let Some((child, code)) = reaped else {
            return if options & WNOHANG != 0 {
                Ok(None)
            } else {
                Err(Errno::EAGAIN)
            };
        };

        if let Some(mut zombie) = self.processes.remove(&child) {
            zombie.state = ProcessState::Dead;
        }
        if let Some(parent) = self.processes.get_mut(&pid) {
            parent.children.retain(|c| *c != child);
        }
        self.events.push(KernelEvent::Reaped { pid: child });
        tracing::debug!(parent = %pid, %child, code, "reaped");
        Ok(Some((child, abi::wait_status_exited(code))))
    }

    // ========== SIGNALS ==========

    pub(super) fn sys_kill(&mut self, pid: Pid, target: i32, sig: u32) -> SyscallResult<()> {
        let signal = match sig {
            0 => None,
            n => Some(Signal::from_num(n).ok_or(Errno::EINVAL)?),
        };
        if target <= 0 {
            return Err(Errno::EINVAL);
        }
        let target = Pid(target as u32);
        let sender_uid = self.live(pid)?.uid;
        let receiver = self.live(target)?;
        if sender_uid != 0 && sender_uid != receiver.uid {
            return Err(Errno::EPERM);
        }
        let Some(signal) = signal else {
            return Ok(());
        };

        let receiver = self.live_mut(target)?;
        match receiver.signals.deliver(signal) {
            Delivery::Terminate => {
                tracing::debug!(sender = %pid, %target, %signal, "terminated by signal");
                self.sys_exit(target, 128 + signal.num() as i32)?;
            }
            Delivery::Stop => {
                if receiver.state != ProcessState::Stopped {
                    receiver.state = ProcessState::Stopped;
                    self.events.push(KernelEvent::Stopped { pid: target });
                }
            }
            Delivery::Continue => {
                if receiver.state == ProcessState::Stopped {
                    receiver.state = if receiver.all_threads_waiting() {
                        ProcessState::Sleeping
                    } else {
                        ProcessState::Running
                    };
                    self.events.push(KernelEvent::Continued { pid: target });
                }
            }
            Delivery::Ignore | Delivery::Pending => {}
        }
        Ok(())
    }

    /// Install (or with None, query) a disposition; returns the old one
    pub(super) fn sys_rt_sigaction(&mut self, pid: Pid, sig: u32, new: Option<Disposition>) -> SyscallResult<Disposition> {
        let signal = Signal::from_num(sig).ok_or(Errno::EINVAL)?;
        let signals = &mut self.live_mut(pid)?.signals;
        match new {
            Some(disposition) => signals.set_disposition(signal, disposition),
            None => Ok(signals.disposition(signal)),
        }
    }

    // ========== FUTEX ==========

    /// Park the active thread on `uaddr` if the word still holds `expected`
    pub(super) fn sys_futex_wait(&mut self, pid: Pid, uaddr: u64, current: u32, expected: u32) -> SyscallResult<()> {
        if current != expected {
            return Err(Errno::EAGAIN);
        }
        let process = self.live_mut(pid)?;
        let tid = process.active_tid;
        let thread = process.thread_mut(tid).ok_or(Errno::ESRCH)?;
        thread.state = ThreadState::FutexWait(uaddr as u32);

        let blocked = process.all_threads_waiting();
        if blocked && process.state == ProcessState::Running {
            process.state = ProcessState::Sleeping;
            self.events.push(KernelEvent::Blocked { pid });
        }
        self.futexes.entry((pid, uaddr)).or_default().push_back(tid);
        Ok(())
    }

    /// Wake up to `count` threads parked on `uaddr`; returns how many woke
    pub(super) fn sys_futex_wake(&mut self, pid: Pid, uaddr: u64, count: u32) -> SyscallResult<u32> {
        self.live(pid)?;
        let mut woken = Vec::new();
        if let Some(queue) = self.futexes.get_mut(&(pid, uaddr)) {
            while woken.len() < count as usize {
                let Some(tid) = queue.pop_front() else { break };
                woken.push(tid);
            }
            if queue.is_empty() {
                self.futexes.remove(&(pid, uaddr));
            }
        }

        let process = self.live_mut(pid)?;
        for tid in &woken {
            if let Some(thread) = process.thread_mut(*tid) {
                thread.state = ThreadState::Runnable;
            }
        }
        if !woken.is_empty() && process.state == ProcessState::Sleeping {
            process.state = ProcessState::Running;
            self.events.push(KernelEvent::Woken { pid });
        }
        Ok(woken.len() as u32)
    }

    /// Host-side switch of the thread that subsequent syscalls act for
    pub fn set_active_thread(&mut self, pid: Pid, tid: u32) -> SyscallResult<()> {
        let process = self.live_mut(pid)?;
        match process.thread(tid).map(|t| t.state) {
            Some(ThreadState::Exited) | None => Err(Errno::ESRCH),
            Some(_) => {
                process.active_tid = tid;
                Ok(())
            }
        }
    }

    // ========== MEMORY ==========

    pub(super) fn sys_brk(&mut self, pid: Pid, addr: u64) -> SyscallResult<u64> {
        Ok(self.live_mut(pid)?.address_space.brk(addr)?)
    }

    pub(super) fn sys_mmap(&mut self, pid: Pid, addr: u64, len: u64, prot: u32, flags: u32, fd: i32) -> SyscallResult<u64> {
        // File-backed mappings only reserve the range; contents are not paged in
        if flags & MAP_ANONYMOUS == 0 {
            let fd = u32::try_from(fd).map_err(|_| Errno::EBADF)?;
            self.fd_handle(pid, super::process::Fd(fd))?;
        }
        let address_space = &mut self.live_mut(pid)?.address_space;
        Ok(address_space.mmap(addr, len, prot, flags)?)
    }

    pub(super) fn sys_munmap(&mut self, pid: Pid, addr: u64, len: u64) -> SyscallResult<()> {
        Ok(self.live_mut(pid)?.address_space.munmap(addr, len)?)
    }

    pub(super) fn sys_mprotect(&mut self, pid: Pid, addr: u64, len: u64, prot: u32) -> SyscallResult<()> {
        Ok(self.live_mut(pid)?.address_space.mprotect(addr, len, prot)?)
    }

    // ========== TIME ==========

    fn wall_clock_ms(&self) -> f64 {
        self.config.boot_epoch_ms + self.now()
    }

    pub(super) fn sys_time(&mut self, pid: Pid) -> SyscallResult<i64> {
        self.live(pid)?;
        Ok((self.wall_clock_ms() / 1000.0).floor() as i64)
    }

    pub(super) fn sys_gettimeofday(&mut self, pid: Pid) -> SyscallResult<Timeval> {
        self.live(pid)?;
        Ok(Timeval::from_millis(self.wall_clock_ms()))
    }

    pub(super) fn sys_clock_gettime(&mut self, pid: Pid, clock: u32) -> SyscallResult<Timespec> {
        self.live(pid)?;
        match clock {
            abi::clock::CLOCK_REALTIME => Ok(Timespec::from_millis(self.wall_clock_ms())),
            abi::clock::CLOCK_MONOTONIC => Ok(Timespec::from_millis(self.now())),
            _ => Err(Errno::EINVAL),
        }
    }
}
