//! Bootstrap
//!
//! Lays out the root filesystem, creates the device nodes and the init
//! image, then starts pid 1 with stdin/stdout/stderr wired to the
//! host-facing devices.

use super::errno::SyscallResult;
use super::files::OpenObject;
use super::process::{Fd, OpenFlags, Pid, VirtualProcess};
use super::syscall::Kernel;
use super::wasm::{ProgramLoader, WasmInstance, minimal_command_module};
use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::vfs::DeviceKind;
use std::sync::Arc;

/// Path of the first program
pub const INIT_PATH: &str = "/sbin/init";

/// Top-level directories created at boot
const ROOT_DIRS: [&str; 14] = [
    "/bin", "/sbin", "/etc", "/var", "/tmp", "/dev", "/proc", "/sys", "/home", "/root", "/lib", "/usr",
    "/mnt", "/opt",
];

impl Kernel {
    /// Build a kernel with the standard layout and a running init
    pub fn boot(config: KernelConfig, clock: Arc<dyn Clock>, loader: Box<dyn ProgramLoader>) -> SyscallResult<Self> {
        let mut kernel = Kernel::new(config, clock, loader);
        kernel.vfs.set_clock(kernel.now());

        for dir in ROOT_DIRS {
            kernel.vfs.create_dir_all(dir, 0o755)?;
        }
        kernel.vfs.chmod("/tmp", 0o1777)?;
        kernel.vfs.chmod("/root", 0o700)?;

        for device in DeviceKind::ALL {
            let mode = match device {
                DeviceKind::Stdin => 0o444,
                DeviceKind::Stdout | DeviceKind::Stderr => 0o222,
                _ => 0o666,
            };
            kernel.vfs.create_device("/dev", device.name(), device, mode)?;
        }

        let image_bytes = minimal_command_module();
        kernel.vfs.write_file(INIT_PATH, &image_bytes, 0o755)?;
        let image = kernel.loader.load(INIT_PATH, &image_bytes)?;

        let pid = kernel.alloc_pid();
        debug_assert_eq!(pid, Pid::INIT);
        let mut init = VirtualProcess::new(
            pid,
            0,
            INIT_PATH.to_string(),
            vec![INIT_PATH.to_string()],
            vec!["PATH=/bin:/sbin".to_string(), "HOME=/root".to_string()],
            0,
            0,
            WasmInstance::from_image(image, kernel.config.linear_memory_size),
            kernel.config.max_fds_per_process,
            kernel.config.memory_limit,
            kernel.now(),
        );

        let stdio = [
            (Fd::STDIN, DeviceKind::Stdin, OpenFlags::READ),
            (Fd::STDOUT, DeviceKind::Stdout, OpenFlags::RDWR),
            (Fd::STDERR, DeviceKind::Stderr, OpenFlags::RDWR),
        ];
        for (fd, device, flags) in stdio {
            let handle = kernel.files.open(OpenObject::Device(device), flags);
            init.files.insert(fd, handle);
        }
        kernel.processes.insert(pid, init);

        tracing::info!(
            nodes = kernel.vfs.node_count(),
            max_processes = kernel.config.max_processes,
            "kernel booted"
        );
        Ok(kernel)
    }
}
