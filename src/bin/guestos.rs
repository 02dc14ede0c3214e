//! guestos CLI - boots an emulator and drives a synthetic workload
//!
//! Init forks a set of workers and parks while they run. Workers
//! alternate between file I/O and (simulated) model calls, so the
//! scheduler sees a mix of io-bound and ai-compute processes. At the end
//! the workers exit, init reaps them, and the metrics are printed.
//!
//! Run with: RUST_LOG=guestos=debug cargo run -- --policy cfs --workers 6

#[cfg(not(target_arch = "wasm32"))]
mod cli {
    use anyhow::{Context, Result, bail};
    use clap::Parser;
    use guestos::dispatch::{ProfilingHook, RuleBasedScorer, SecurityHook};
    use guestos::kernel::abi::open::{O_CREAT, O_RDWR};
    use guestos::kernel::abi::wait::WNOHANG;
    use guestos::kernel::wasm::minimal_command_module;
    use guestos::{Emulator, EmulatorConfig, EmulatorMetrics, Pid, SchedulingPolicy, SyscallArgs, SyscallNr};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tracing::info;

    const WORKER_PATH: &str = "/bin/worker";

    /// Guest addresses used by the workload
    const PATH_ADDR: u64 = 0x1000;
    const STAT_ADDR: u64 = 0x2000;
    const DATA_ADDR: u64 = 0x3000;
    const DATA_LEN: u64 = 64;

    #[derive(Parser)]
    #[command(name = "guestos", about = "Guest-process kernel emulator")]
    struct Cli {
        /// JSON config file (defaults apply to anything it leaves out)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Scheduling policy, overriding the config
        #[arg(short, long)]
        policy: Option<SchedulingPolicy>,

        /// Worker processes to fork from init
        #[arg(short, long, default_value_t = 4)]
        workers: u32,

        /// Emulated run time (ms)
        #[arg(short, long, default_value_t = 500.0)]
        duration: f64,

        /// Emulated time per scheduler tick (ms)
        #[arg(long, default_value_t = 1.0)]
        tick: f64,

        /// Print metrics as JSON
        #[arg(long)]
        json: bool,
    }

    pub async fn main() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env().add_directive("guestos=info".parse()?),
            )
            .init();

        let cli = Cli::parse();
        if cli.tick <= 0.0 {
            bail!("--tick must be positive");
        }
        let mut config = match &cli.config {
            Some(path) => EmulatorConfig::load(path)?,
            None => EmulatorConfig::default(),
        };
        if let Some(policy) = cli.policy {
            config.scheduler.policy = policy;
        }

        let metrics = run(config, &cli).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        } else {
            report(&metrics);
        }
        Ok(())
    }

    fn place_str(emu: &mut Emulator, pid: Pid, s: &str) -> Result<()> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        emu.kernel_mut()
            .write_guest(pid, PATH_ADDR, &bytes)
            .with_context(|| format!("writing path for {pid}"))
    }

    async fn call(emu: &mut Emulator, pid: Pid, nr: SyscallNr, args: &[u64]) -> i64 {
        emu.syscall(pid, nr.num(), SyscallArgs::new(args)).await.value
    }

    async fn run(config: EmulatorConfig, cli: &Cli) -> Result<EmulatorMetrics> {
        let mut emu = Emulator::boot(config)?;
        emu.register_hook(Arc::new(SecurityHook::new(Arc::new(RuleBasedScorer::new()))));
        let profiler = Arc::new(ProfilingHook::new());
        emu.register_hook(profiler.clone());

        emu.kernel_mut()
            .vfs_mut()
            .write_file(WORKER_PATH, &minimal_command_module(), 0o755)
            .context("installing worker image")?;

        let mut workers = Vec::new();
        for _ in 0..cli.workers {
            let child = call(&mut emu, Pid::INIT, SyscallNr::Fork, &[]).await;
            if child < 0 {
                bail!("fork failed after {} workers", workers.len());
            }
            workers.push(Pid(child as u32));
        }

        // Init has nothing to do until its children exit
        emu.scheduler_mut().set_runnable(Pid::INIT, false);

        for pid in &workers {
            if !emu.run_until_current(*pid, cli.tick, 1_000.0) {
                bail!("{pid} was never scheduled");
            }
            place_str(&mut emu, *pid, WORKER_PATH)?;
            if call(&mut emu, *pid, SyscallNr::Execve, &[PATH_ADDR, 0, 0]).await < 0 {
                bail!("execve {WORKER_PATH} failed for {pid}");
            }
            place_str(&mut emu, *pid, &format!("/tmp/worker-{}", pid.0))?;
        }
        info!(workers = workers.len(), "workload started");

        let mut elapsed = 0.0;
        let mut steps = 0u64;
        while elapsed < cli.duration {
            if let Some(pid) = emu.current() {
                let index = workers.iter().position(|w| *w == pid).unwrap_or(0);
                step(&mut emu, pid, index, steps).await;
                steps += 1;
                if steps % 16 == 0 {
                    emu.reclassify(pid);
                }
            }
            emu.tick(cli.tick);
            elapsed += cli.tick;
        }

        for pid in &workers {
            if emu.run_until_current(*pid, cli.tick, cli.duration.max(1_000.0)) {
                call(&mut emu, *pid, SyscallNr::Exit, &[0]).await;
            }
        }
        emu.scheduler_mut().set_runnable(Pid::INIT, true);
        emu.run_until_current(Pid::INIT, cli.tick, 1_000.0);
        let mut reaped = 0;
        while call(&mut emu, Pid::INIT, SyscallNr::Wait4, &[u64::MAX, 0, WNOHANG as u64]).await > 0 {
            reaped += 1;
        }
        info!(reaped, steps, "workload finished");

        for (pid, calls) in profiler.busiest(3) {
            info!(%pid, calls, "busy process");
        }
        Ok(emu.metrics())
    }

    /// One burst of work for the current process
    async fn step(emu: &mut Emulator, pid: Pid, index: usize, step: u64) {
        if index % 2 == 0 {
            emu.record_ai_op(pid);
            call(emu, pid, SyscallNr::Getpid, &[]).await;
            return;
        }
        let fd = call(emu, pid, SyscallNr::Open, &[PATH_ADDR, (O_CREAT | O_RDWR) as u64, 0o644]).await;
        if fd >= 0 {
            call(emu, pid, SyscallNr::Write, &[fd as u64, DATA_ADDR, DATA_LEN]).await;
            call(emu, pid, SyscallNr::Close, &[fd as u64]).await;
        }
        if step % 4 == 0 {
            call(emu, pid, SyscallNr::Stat, &[PATH_ADDR, STAT_ADDR]).await;
        }
    }

    fn report(metrics: &EmulatorMetrics) {
        let d = &metrics.dispatcher;
        let s = &metrics.scheduler;
        println!("guestos: {:.0} ms emulated, {} processes", metrics.now, metrics.processes);
        println!(
            "dispatch: {} calls, {} errors, {:.0}/s, cache hit rate {:.1}%, {} security blocks",
            d.total_calls,
            d.total_errors,
            d.throughput_per_sec,
            d.cache_hit_rate * 100.0,
            d.security_blocks
        );
        for (name, count) in &d.busiest {
            println!("  {name:<14} {count}");
        }
        println!(
            "scheduler: {:?}, {} context switches, {} idle polls, load {:.2} {:.2} {:.2}",
            s.policy, s.context_switches, s.idle_polls, s.load.one, s.load.five, s.load.fifteen
        );
        for m in &metrics.per_process {
            println!(
                "  {:<8} {:<12} {:<9} cpu {:>7.1} ms  switches {:>4}  response {:>6.1} ms",
                m.pid.to_string(),
                m.class.name(),
                format!("{:?}", m.tier),
                m.vruntime,
                m.context_switches,
                m.response_time
            );
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(target_arch = "wasm32")]
fn main() {}
