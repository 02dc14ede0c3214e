//! Invariant Tests
//!
//! Whole-kernel properties that must hold after any sequence of syscalls.
//! Each test drives the public syscall ABI rather than the typed handlers.

use crate::clock::ManualClock;
use crate::config::KernelConfig;
use crate::kernel::abi::open::{O_CREAT, O_RDWR};
use crate::kernel::{Errno, Kernel, Pid, SyscallArgs, SyscallNr, ValidatingLoader};
use std::sync::Arc;

fn boot() -> Kernel {
    Kernel::boot(
        KernelConfig::default(),
        Arc::new(ManualClock::new()),
        Box::new(ValidatingLoader),
    )
    .expect("boot")
}

fn call(kernel: &mut Kernel, pid: Pid, nr: SyscallNr, args: &[u64]) -> i64 {
    kernel.syscall(pid, nr.num(), &SyscallArgs::new(args)).value
}

/// Place a NUL-terminated string in guest memory
fn put_str(kernel: &mut Kernel, pid: Pid, addr: u64, s: &str) -> u64 {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    kernel.write_guest(pid, addr, &bytes).unwrap();
    addr
}

mod process_invariants {
    use super::*;
    use crate::kernel::ProcessState;

    /// Pids are handed out monotonically and never reused
    #[test]
    fn pids_are_never_reused() {
        let mut k = boot();
        let mut seen = vec![1i64];
        for _ in 0..5 {
            let child = call(&mut k, Pid::INIT, SyscallNr::Fork, &[]);
            assert!(child > *seen.last().unwrap());
            seen.push(child);
            call(&mut k, Pid(child as u32), SyscallNr::Exit, &[0]);
            call(&mut k, Pid::INIT, SyscallNr::Wait4, &[child as u64, 0, 0]);
        }
    }

    /// A zombie never runs again and never issues syscalls
    #[test]
    fn zombie_finality() {
        let mut k = boot();
        let child = Pid(call(&mut k, Pid::INIT, SyscallNr::Fork, &[]) as u32);
        call(&mut k, child, SyscallNr::Exit, &[7]);

        let ret = k.syscall(child, SyscallNr::Getpid.num(), &SyscallArgs::default());
        assert_eq!(ret.errno, Some(Errno::ESRCH));
        assert_eq!(k.process(child).unwrap().state, ProcessState::Zombie(7));
    }

    /// Every live non-init process has a live parent that lists it
    #[test]
    fn parent_child_consistency() {
        let mut k = boot();
        let a = Pid(call(&mut k, Pid::INIT, SyscallNr::Fork, &[]) as u32);
        let b = Pid(call(&mut k, a, SyscallNr::Fork, &[]) as u32);
        call(&mut k, a, SyscallNr::Exit, &[0]);

        for process in k.processes().filter(|p| p.is_alive() && p.pid != Pid::INIT) {
            let parent = k.process(Pid(process.ppid)).expect("parent exists");
            assert!(parent.is_alive());
            assert!(parent.children.contains(&process.pid));
        }
        assert_eq!(k.process(b).unwrap().ppid, 1);
    }
}

mod descriptor_invariants {
    use super::*;

    /// Descriptors are unique per process while open and never recycled
    #[test]
    fn fds_unique_and_monotonic() {
        let mut k = boot();
        let path = put_str(&mut k, Pid::INIT, 0x100, "/tmp/f");
        let first = call(&mut k, Pid::INIT, SyscallNr::Open, &[path, (O_CREAT | O_RDWR) as u64, 0o644]);
        call(&mut k, Pid::INIT, SyscallNr::Close, &[first as u64]);
        let second = call(&mut k, Pid::INIT, SyscallNr::Open, &[path, O_RDWR as u64]);
        assert!(second > first);
    }

    /// Every handle a process refers to is live in the open-file table,
    /// and its refcount equals the number of fds pointing at it
    #[test]
    fn refcounts_match_references() {
        let mut k = boot();
        let path = put_str(&mut k, Pid::INIT, 0x100, "/tmp/g");
        let fd = call(&mut k, Pid::INIT, SyscallNr::Open, &[path, (O_CREAT | O_RDWR) as u64, 0o644]);
        call(&mut k, Pid::INIT, SyscallNr::Dup, &[fd as u64]);
        let child = Pid(call(&mut k, Pid::INIT, SyscallNr::Fork, &[]) as u32);
        call(&mut k, child, SyscallNr::Close, &[fd as u64]);

        let mut expected = std::collections::HashMap::new();
        for process in k.processes().filter(|p| p.is_alive()) {
            for (_, handle) in process.files.iter() {
                *expected.entry(handle).or_insert(0usize) += 1;
            }
        }
        for (handle, count) in expected {
            assert_eq!(k.open_files().refcount(handle), count);
        }
    }
}

mod syscall_invariants {
    use super::*;

    /// Unknown numbers fail with ENOSYS and never touch state
    #[test]
    fn unknown_syscall_is_enosys() {
        let mut k = boot();
        let before = k.process_count();
        let ret = k.syscall(Pid::INIT, 9999, &SyscallArgs::default());
        assert_eq!(ret.value, -1);
        assert_eq!(ret.errno, Some(Errno::ENOSYS));
        assert_eq!(k.process_count(), before);
    }

    /// Wild guest pointers are EFAULT, never a panic
    #[test]
    fn bad_pointers_fault() {
        let mut k = boot();
        for nr in [SyscallNr::Open, SyscallNr::Stat, SyscallNr::Chdir, SyscallNr::Mkdir] {
            let ret = k.syscall(Pid::INIT, nr.num(), &SyscallArgs::new(&[u64::MAX - 2, 0]));
            assert_eq!(ret.errno, Some(Errno::EFAULT), "{nr}");
        }
        let ret = k.syscall(Pid::INIT, SyscallNr::Read.num(), &SyscallArgs::new(&[0, u64::MAX, 16]));
        assert_eq!(ret.errno, Some(Errno::EFAULT));
        let ret = k.syscall(Pid::INIT, SyscallNr::Write.num(), &SyscallArgs::new(&[1, 0, u64::MAX]));
        assert_eq!(ret.errno, Some(Errno::EFAULT));
    }

    /// Every number in the table is dispatched: random arguments may fail
    /// but must produce a well-formed return
    #[test]
    fn every_syscall_returns() {
        let mut k = boot();
        for nr in SyscallNr::ALL {
            if matches!(nr, SyscallNr::Exit | SyscallNr::ExitGroup | SyscallNr::Execve) {
                continue;
            }
            let ret = k.syscall(Pid::INIT, nr.num(), &SyscallArgs::new(&[3, 0x200, 8, 0, 0, 0]));
            assert!(ret.value >= 0 || ret.errno.is_some(), "{nr}");
            assert_eq!(ret.errno.is_some(), ret.value == -1, "{nr}");
        }
    }
}

mod vfs_invariants {
    use super::*;

    /// The tree stays acyclic: following `..` from anywhere reaches `/`
    #[test]
    fn dotdot_reaches_root() {
        let mut k = boot();
        let a = put_str(&mut k, Pid::INIT, 0x100, "/tmp/a");
        call(&mut k, Pid::INIT, SyscallNr::Mkdir, &[a, 0o755]);
        let b = put_str(&mut k, Pid::INIT, 0x100, "/tmp/a/b");
        call(&mut k, Pid::INIT, SyscallNr::Mkdir, &[b, 0o755]);
        call(&mut k, Pid::INIT, SyscallNr::Chdir, &[b]);

        let up = put_str(&mut k, Pid::INIT, 0x100, "..");
        for _ in 0..5 {
            call(&mut k, Pid::INIT, SyscallNr::Chdir, &[up]);
        }
        assert_eq!(k.process(Pid::INIT).unwrap().cwd, "/");
    }

    /// A symlink loop resolves to ELOOP instead of spinning
    #[test]
    fn symlink_loop_is_eloop() {
        let mut k = boot();
        let x = put_str(&mut k, Pid::INIT, 0x100, "/tmp/x");
        let y = put_str(&mut k, Pid::INIT, 0x200, "/tmp/y");
        call(&mut k, Pid::INIT, SyscallNr::Symlink, &[y, x]);
        call(&mut k, Pid::INIT, SyscallNr::Symlink, &[x, y]);

        let ret = k.syscall(Pid::INIT, SyscallNr::Stat.num(), &SyscallArgs::new(&[x, 0x400]));
        assert_eq!(ret.errno, Some(Errno::ELOOP));
    }
}
