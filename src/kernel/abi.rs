//! Guest ABI constants and fixed-layout records
//!
//! Flag values mirror Linux x86-64 so that guest libc builds work
//! unmodified. Records that the kernel copies into guest linear memory are
//! `#[repr(C)]` and `Pod`, so their byte layout is fixed.

use bytemuck::{Pod, Zeroable};

/// Flags for `open`
pub mod open {
    pub const O_RDONLY: u32 = 0o0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_ACCMODE: u32 = 0o3;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    pub const O_DIRECTORY: u32 = 0o200000;
}

/// `whence` values for `lseek`
pub mod seek {
    pub const SEEK_SET: u32 = 0;
    pub const SEEK_CUR: u32 = 1;
    pub const SEEK_END: u32 = 2;
}

/// File type bits of `st_mode`
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFSOCK: u32 = 0o140000;
}

/// Memory mapping flags
pub mod mman {
    pub const PROT_NONE: u32 = 0x0;
    pub const PROT_READ: u32 = 0x1;
    pub const PROT_WRITE: u32 = 0x2;
    pub const PROT_EXEC: u32 = 0x4;

    pub const MAP_SHARED: u32 = 0x01;
    pub const MAP_PRIVATE: u32 = 0x02;
    pub const MAP_FIXED: u32 = 0x10;
    pub const MAP_ANONYMOUS: u32 = 0x20;
}

/// Socket families and types
pub mod socket {
    pub const AF_UNIX: u32 = 1;
    pub const AF_INET: u32 = 2;

    pub const SOCK_STREAM: u32 = 1;
    pub const SOCK_DGRAM: u32 = 2;

    /// Size of `struct sockaddr_in`
    pub const SOCKADDR_IN_LEN: usize = 16;
}

/// `clone` flags
pub mod clone {
    pub const CLONE_VM: u64 = 0x0000_0100;
    pub const CLONE_THREAD: u64 = 0x0001_0000;
}

/// `futex` operations
pub mod futex {
    pub const FUTEX_WAIT: u32 = 0;
    pub const FUTEX_WAKE: u32 = 1;
    pub const FUTEX_PRIVATE_FLAG: u32 = 128;
}

/// `wait4` options
pub mod wait {
    pub const WNOHANG: u32 = 1;
}

/// Clock ids for `clock_gettime`
pub mod clock {
    pub const CLOCK_REALTIME: u32 = 0;
    pub const CLOCK_MONOTONIC: u32 = 1;
}

/// Status record written by `stat`, `lstat` and `fstat`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StatBuf {
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    /// Timestamps in milliseconds since the emulator epoch
    pub st_atime_ms: i64,
    pub st_mtime_ms: i64,
    pub st_ctime_ms: i64,
}

/// `struct timeval` for `gettimeofday`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Timeval {
    pub tv_sec: i64,
    pub tv_usec: i64,
}

/// `struct timespec` for `clock_gettime`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    pub fn from_millis(ms: f64) -> Self {
        let total_ns = (ms * 1_000_000.0) as i64;
        Self {
            tv_sec: total_ns.div_euclid(1_000_000_000),
            tv_nsec: total_ns.rem_euclid(1_000_000_000),
        }
    }
}

impl Timeval {
    pub fn from_millis(ms: f64) -> Self {
        let total_us = (ms * 1_000.0) as i64;
        Self {
            tv_sec: total_us.div_euclid(1_000_000),
            tv_usec: total_us.rem_euclid(1_000_000),
        }
    }
}

/// Encode an exit status the way `wait4` reports it (`WEXITSTATUS`)
pub fn wait_status_exited(code: i32) -> u32 {
    ((code as u32) & 0xff) << 8
}
