//! Integration tests for guestos
//!
//! End-to-end checks across the emulator, dispatcher, kernel and scheduler.
//! Every test boots its own emulator on a manual clock, so nothing is shared.

use guestos::dispatch::{ProcessIdentity, RuleBasedScorer, SecurityHook, SyscallHandler};
use guestos::kernel::abi::StatBuf;
use guestos::kernel::abi::open::{O_CREAT, O_RDWR};
use guestos::kernel::abi::seek::SEEK_SET;
use guestos::kernel::{GuestWrite, ValidatingLoader};
use guestos::sched::BehaviorSnapshot;
use guestos::{
    Clock, Dispatcher, DispatcherConfig, Emulator, EmulatorConfig, Errno, Kernel, KernelConfig, ManualClock,
    Pid, Scheduler, SchedulerConfig, SchedulingPolicy, SyscallArgs, SyscallNr, SyscallReturn,
};
use std::sync::Arc;

const PATH_ADDR: u64 = 0x1000;
const BUF_ADDR: u64 = 0x2000;
const STAT_ADDR: u64 = 0x3000;

/// Boot an emulator with the given scheduling policy
fn boot(policy: SchedulingPolicy) -> Emulator {
    let mut config = EmulatorConfig::default();
    config.scheduler.policy = policy;
    Emulator::boot(config).unwrap()
}

/// Place a NUL-terminated path in the guest's memory
fn place_path(emu: &mut Emulator, pid: Pid, path: &str) {
    let mut bytes = path.as_bytes().to_vec();
    bytes.push(0);
    emu.kernel_mut().write_guest(pid, PATH_ADDR, &bytes).unwrap();
}

async fn call(emu: &mut Emulator, pid: Pid, nr: SyscallNr, args: &[u64]) -> SyscallReturn {
    emu.syscall(pid, nr.num(), SyscallArgs::new(args)).await
}

async fn open_path(emu: &mut Emulator, pid: Pid, path: &str) -> u64 {
    place_path(emu, pid, path);
    let ret = call(emu, pid, SyscallNr::Open, &[PATH_ADDR, (O_CREAT | O_RDWR) as u64, 0o644]).await;
    assert!(!ret.is_error(), "open {path}: {ret:?}");
    ret.value as u64
}

fn read_stat(emu: &Emulator, pid: Pid) -> StatBuf {
    let bytes = emu
        .kernel()
        .read_guest(pid, STAT_ADDR, std::mem::size_of::<StatBuf>())
        .unwrap();
    bytemuck::pod_read_unaligned(&bytes)
}

// ============================================================================
// Boot
// ============================================================================

#[tokio::test]
async fn test_boot_layout() {
    let mut emu = boot(SchedulingPolicy::Priority);
    let vfs = emu.kernel().vfs();
    for dir in ["/bin", "/sbin", "/etc", "/tmp", "/dev", "/home", "/root"] {
        assert!(vfs.exists(dir), "{dir} missing");
    }
    for device in ["/dev/null", "/dev/zero", "/dev/stdin", "/dev/stdout", "/dev/stderr"] {
        assert!(vfs.exists(device), "{device} missing");
    }

    let init = emu.kernel().process(Pid::INIT).unwrap();
    assert_eq!(init.command, "/sbin/init");
    assert_eq!(init.uid, 0);
    assert_eq!(init.ppid, 0);

    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Getpid, &[]).await.value, 1);
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Getppid, &[]).await.value, 0);
}

#[tokio::test]
async fn test_stdio_reaches_host() {
    let mut emu = boot(SchedulingPolicy::Priority);
    emu.kernel_mut().push_stdin(b"hi\n");
    let ret = call(&mut emu, Pid::INIT, SyscallNr::Read, &[0, BUF_ADDR, 16]).await;
    assert_eq!(ret.value, 3);
    assert_eq!(emu.kernel().read_guest(Pid::INIT, BUF_ADDR, 3).unwrap(), b"hi\n");

    emu.kernel_mut().write_guest(Pid::INIT, BUF_ADDR, b"out").unwrap();
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Write, &[1, BUF_ADDR, 3]).await.value, 3);
    assert_eq!(emu.kernel_mut().take_stdout(), b"out");
}

// ============================================================================
// Files
// ============================================================================

#[tokio::test]
async fn test_create_then_stat_is_empty() {
    let mut emu = boot(SchedulingPolicy::Priority);
    open_path(&mut emu, Pid::INIT, "/tmp/new.txt").await;

    let ret = call(&mut emu, Pid::INIT, SyscallNr::Stat, &[PATH_ADDR, STAT_ADDR]).await;
    assert_eq!(ret.value, 0);
    assert_eq!(read_stat(&emu, Pid::INIT).st_size, 0);
}

#[tokio::test]
async fn test_write_then_read_back() {
    let mut emu = boot(SchedulingPolicy::Priority);
    let fd = open_path(&mut emu, Pid::INIT, "/tmp/data.bin").await;

    let payload = b"guest bytes";
    emu.kernel_mut().write_guest(Pid::INIT, BUF_ADDR, payload).unwrap();
    let n = payload.len() as u64;
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Write, &[fd, BUF_ADDR, n]).await.value, n as i64);
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Lseek, &[fd, 0, SEEK_SET as u64]).await.value, 0);

    // clobber the buffer so the read has to fill it
    emu.kernel_mut().write_guest(Pid::INIT, BUF_ADDR, &[0; 11]).unwrap();
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Read, &[fd, BUF_ADDR, n]).await.value, n as i64);
    assert_eq!(emu.kernel().read_guest(Pid::INIT, BUF_ADDR, payload.len()).unwrap(), payload);
}

#[tokio::test]
async fn test_closed_fd_is_ebadf() {
    let mut emu = boot(SchedulingPolicy::Priority);
    let fd = open_path(&mut emu, Pid::INIT, "/tmp/closed").await;
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Close, &[fd]).await.value, 0);

    let read = call(&mut emu, Pid::INIT, SyscallNr::Read, &[fd, BUF_ADDR, 4]).await;
    assert_eq!(read.errno, Some(Errno::EBADF));
    let write = call(&mut emu, Pid::INIT, SyscallNr::Write, &[fd, BUF_ADDR, 4]).await;
    assert_eq!(write.errno, Some(Errno::EBADF));
    let close = call(&mut emu, Pid::INIT, SyscallNr::Close, &[fd]).await;
    assert_eq!(close.errno, Some(Errno::EBADF));
}

#[tokio::test]
async fn test_unknown_syscall_changes_nothing() {
    let mut emu = boot(SchedulingPolicy::Priority);
    let processes = emu.kernel().process_count();
    let nodes = emu.kernel().vfs().node_count();
    let open = emu.kernel().open_files().len();
    let fds = emu.kernel().process(Pid::INIT).unwrap().files.len();

    let ret = emu.syscall(Pid::INIT, 999, SyscallArgs::new(&[1, 2, 3])).await;
    assert_eq!(ret.errno, Some(Errno::ENOSYS));
    assert_eq!(ret.value, -(Errno::ENOSYS as i64));

    assert_eq!(emu.kernel().process_count(), processes);
    assert_eq!(emu.kernel().vfs().node_count(), nodes);
    assert_eq!(emu.kernel().open_files().len(), open);
    assert_eq!(emu.kernel().process(Pid::INIT).unwrap().files.len(), fds);
}

// ============================================================================
// Processes
// ============================================================================

#[tokio::test]
async fn test_fork_child_close_leaves_parent_fd() {
    let mut emu = boot(SchedulingPolicy::Cfs);
    let fd = open_path(&mut emu, Pid::INIT, "/tmp/shared").await;

    let ret = call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await;
    assert!(ret.value > 1);
    let child = Pid(ret.value as u32);
    assert_eq!(emu.kernel().process(child).unwrap().ppid, 1);

    assert!(emu.run_until_current(child, 1.0, 200.0));
    assert_eq!(call(&mut emu, child, SyscallNr::Getpid, &[]).await.value, child.0 as i64);
    assert_eq!(call(&mut emu, child, SyscallNr::Getppid, &[]).await.value, 1);
    assert_eq!(call(&mut emu, child, SyscallNr::Close, &[fd]).await.value, 0);

    assert!(emu.run_until_current(Pid::INIT, 1.0, 200.0));
    emu.kernel_mut().write_guest(Pid::INIT, BUF_ADDR, b"ok").unwrap();
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Write, &[fd, BUF_ADDR, 2]).await.value, 2);
}

#[tokio::test]
async fn test_exit_and_reap() {
    let mut emu = boot(SchedulingPolicy::Cfs);
    let child = Pid(call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await.value as u32);
    assert!(emu.run_until_current(child, 1.0, 200.0));
    call(&mut emu, child, SyscallNr::Exit, &[7]).await;
    assert!(!emu.scheduler().contains(child));

    assert!(emu.run_until_current(Pid::INIT, 1.0, 200.0));
    let ret = call(&mut emu, Pid::INIT, SyscallNr::Wait4, &[child.0 as u64, BUF_ADDR, 0]).await;
    assert_eq!(ret.value, child.0 as i64);
    let status = emu.kernel().read_guest(Pid::INIT, BUF_ADDR, 4).unwrap();
    let status = u32::from_le_bytes([status[0], status[1], status[2], status[3]]);
    assert_eq!((status >> 8) & 0xff, 7);
    assert!(emu.kernel().process(child).is_none());
}

#[tokio::test]
async fn test_only_current_process_may_call() {
    let mut emu = boot(SchedulingPolicy::Priority);
    let child = Pid(call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await.value as u32);
    assert_eq!(emu.current(), Some(Pid::INIT));
    let ret = call(&mut emu, child, SyscallNr::Getpid, &[]).await;
    assert_eq!(ret.errno, Some(Errno::EAGAIN));
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_round_robin_visits_every_process() {
    let mut emu = boot(SchedulingPolicy::RoundRobin);
    let mut expected = vec![Pid::INIT];
    for _ in 0..3 {
        expected.push(Pid(call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await.value as u32));
    }

    let mut seen: Vec<Pid> = (0..expected.len())
        .map(|_| emu.scheduler_mut().schedule().unwrap())
        .collect();
    seen.sort();
    expected.sort();
    assert_eq!(seen, expected);
}

#[test]
fn test_cfs_runs_least_cpu_first() {
    let mut scheduler = Scheduler::new(SchedulerConfig {
        policy: SchedulingPolicy::Cfs,
        ..SchedulerConfig::default()
    });
    for (pid, cpu_time) in [(2, 40.0), (3, 5.0), (4, 25.0)] {
        scheduler.add_process(&BehaviorSnapshot {
            cpu_time,
            age: 400.0,
            ..BehaviorSnapshot::new(Pid(pid))
        });
    }
    assert_eq!(scheduler.schedule(), Some(Pid(3)));
}

#[tokio::test]
async fn test_metrics_serialize() {
    let mut emu = boot(SchedulingPolicy::Priority);
    call(&mut emu, Pid::INIT, SyscallNr::Getpid, &[]).await;
    emu.tick(3.0);

    let metrics = emu.metrics();
    assert_eq!(metrics.processes, 1);
    assert_eq!(metrics.dispatcher.total_calls, 1);

    let json = serde_json::to_value(&metrics).unwrap();
    assert_eq!(json["now"], 3.0);
    assert_eq!(json["per_process"][0]["class"], "system");
    assert_eq!(json["per_process"][0]["tier"], "realtime");
}

// ============================================================================
// Dispatch pipeline over the real kernel
// ============================================================================

/// Kernel wrapper that counts how often the handler actually runs
struct CountingKernel {
    kernel: Kernel,
    calls: usize,
}

impl SyscallHandler for CountingKernel {
    fn handle(&mut self, pid: Pid, nr: u32, args: &SyscallArgs) -> SyscallReturn {
        self.calls += 1;
        self.kernel.syscall(pid, nr, args)
    }

    fn take_guest_writes(&mut self) -> Vec<GuestWrite> {
        self.kernel.take_guest_writes()
    }

    fn replay_guest_writes(&mut self, pid: Pid, writes: &[GuestWrite]) {
        SyscallHandler::replay_guest_writes(&mut self.kernel, pid, writes);
    }

    fn cache_key_extra(&self, pid: Pid, nr: u32, args: &SyscallArgs) -> Option<Vec<u8>> {
        SyscallHandler::cache_key_extra(&self.kernel, pid, nr, args)
    }

    fn identity(&self, pid: Pid) -> Option<ProcessIdentity> {
        SyscallHandler::identity(&self.kernel, pid)
    }
}

fn counting_dispatcher() -> (Dispatcher<CountingKernel>, ManualClock) {
    let clock = ManualClock::new();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let kernel = Kernel::boot(KernelConfig::default(), shared.clone(), Box::new(ValidatingLoader)).unwrap();
    let handler = CountingKernel { kernel, calls: 0 };
    (Dispatcher::new(handler, DispatcherConfig::default(), shared), clock)
}

#[tokio::test]
async fn test_stat_cached_within_ttl() {
    let (mut dispatcher, clock) = counting_dispatcher();
    dispatcher
        .handler_mut()
        .kernel
        .write_guest(Pid::INIT, PATH_ADDR, b"/etc\0")
        .unwrap();
    let stat = || SyscallArgs::new(&[PATH_ADDR, STAT_ADDR]);
    let nr = SyscallNr::Stat.num();

    assert_eq!(dispatcher.dispatch(Pid::INIT, nr, stat()).await.value, 0);
    clock.advance(4_999.0);
    assert_eq!(dispatcher.dispatch(Pid::INIT, nr, stat()).await.value, 0);
    assert_eq!(dispatcher.handler().calls, 1);
    assert_eq!(dispatcher.stats().cache_hits, 1);

    clock.advance(1.0);
    dispatcher.dispatch(Pid::INIT, nr, stat()).await;
    assert_eq!(dispatcher.handler().calls, 2);
}

#[tokio::test]
async fn test_cached_stat_refills_guest_buffer() {
    let (mut dispatcher, _clock) = counting_dispatcher();
    let kernel = &mut dispatcher.handler_mut().kernel;
    kernel.write_guest(Pid::INIT, PATH_ADDR, b"/sbin/init\0").unwrap();
    let nr = SyscallNr::Stat.num();

    dispatcher.dispatch(Pid::INIT, nr, SyscallArgs::new(&[PATH_ADDR, STAT_ADDR])).await;
    let size = std::mem::size_of::<StatBuf>();
    let first = dispatcher.handler().kernel.read_guest(Pid::INIT, STAT_ADDR, size).unwrap();

    dispatcher
        .handler_mut()
        .kernel
        .write_guest(Pid::INIT, STAT_ADDR, &vec![0; size])
        .unwrap();
    dispatcher.dispatch(Pid::INIT, nr, SyscallArgs::new(&[PATH_ADDR, STAT_ADDR])).await;
    assert_eq!(dispatcher.handler().calls, 1);
    let replayed = dispatcher.handler().kernel.read_guest(Pid::INIT, STAT_ADDR, size).unwrap();
    assert_eq!(first, replayed);
}

#[tokio::test]
async fn test_security_verdict_blocks_before_handler() {
    let (mut dispatcher, _clock) = counting_dispatcher();
    dispatcher.register_hook(Arc::new(SecurityHook::new(Arc::new(RuleBasedScorer::new()))));

    // signalling every process is scored high
    let args = SyscallArgs::new(&[(-1i64) as u64, 9]);
    let ret = dispatcher.dispatch(Pid::INIT, SyscallNr::Kill.num(), args).await;
    assert_eq!(ret.errno, Some(Errno::EPERM));
    assert_eq!(dispatcher.handler().calls, 0);
    assert_eq!(dispatcher.stats().security_blocks, 1);
    assert_eq!(dispatcher.audit().blocked().len(), 1);

    // ordinary calls still go through
    let ret = dispatcher.dispatch(Pid::INIT, SyscallNr::Getpid.num(), SyscallArgs::default()).await;
    assert_eq!(ret.value, 1);
    assert_eq!(dispatcher.handler().calls, 1);
}

#[tokio::test]
async fn test_unlink_invalidates_cached_stat() {
    let mut emu = boot(SchedulingPolicy::Priority);
    let fd = open_path(&mut emu, Pid::INIT, "/tmp/doomed").await;
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Stat, &[PATH_ADDR, STAT_ADDR]).await.value, 0);
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Stat, &[PATH_ADDR, STAT_ADDR]).await.value, 0);
    assert_eq!(emu.dispatcher().stats().cache_hits, 1);

    // still open: unlink refuses
    let busy = call(&mut emu, Pid::INIT, SyscallNr::Unlink, &[PATH_ADDR]).await;
    assert_eq!(busy.errno, Some(Errno::EBUSY));
    call(&mut emu, Pid::INIT, SyscallNr::Close, &[fd]).await;
    assert_eq!(call(&mut emu, Pid::INIT, SyscallNr::Unlink, &[PATH_ADDR]).await.value, 0);

    let gone = call(&mut emu, Pid::INIT, SyscallNr::Stat, &[PATH_ADDR, STAT_ADDR]).await;
    assert_eq!(gone.errno, Some(Errno::ENOENT));
}
