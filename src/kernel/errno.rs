//! Guest-visible error numbers
//!
//! These are expected outcomes, not Rust errors: every handler failure is
//! reported to the guest as `-1` plus one of these codes. The numeric values
//! follow Linux so compiled guest code stays portable.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[repr(i32)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM = 1,
    #[error("no such file or directory")]
    ENOENT = 2,
    #[error("no such process")]
    ESRCH = 3,
    #[error("interrupted system call")]
    EINTR = 4,
    #[error("I/O error")]
    EIO = 5,
    #[error("exec format error")]
    ENOEXEC = 8,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("no child processes")]
    ECHILD = 10,
    #[error("resource temporarily unavailable")]
    EAGAIN = 11,
    #[error("out of memory")]
    ENOMEM = 12,
    #[error("permission denied")]
    EACCES = 13,
    #[error("bad address")]
    EFAULT = 14,
    #[error("device or resource busy")]
    EBUSY = 16,
    #[error("file exists")]
    EEXIST = 17,
    #[error("not a directory")]
    ENOTDIR = 20,
    #[error("is a directory")]
    EISDIR = 21,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("too many open files")]
    EMFILE = 24,
    #[error("illegal seek")]
    ESPIPE = 29,
    #[error("broken pipe")]
    EPIPE = 32,
    #[error("file name too long")]
    ENAMETOOLONG = 36,
    #[error("function not implemented")]
    ENOSYS = 38,
    #[error("directory not empty")]
    ENOTEMPTY = 39,
    #[error("too many levels of symbolic links")]
    ELOOP = 40,
    #[error("socket operation on non-socket")]
    ENOTSOCK = 88,
    #[error("destination address required")]
    EDESTADDRREQ = 89,
    #[error("protocol not supported")]
    EPROTONOSUPPORT = 93,
    #[error("operation not supported")]
    EOPNOTSUPP = 95,
    #[error("address family not supported")]
    EAFNOSUPPORT = 97,
    #[error("address already in use")]
    EADDRINUSE = 98,
    #[error("transport endpoint is already connected")]
    EISCONN = 106,
    #[error("transport endpoint is not connected")]
    ENOTCONN = 107,
    #[error("connection refused")]
    ECONNREFUSED = 111,
}

impl Errno {
    /// The numeric errno value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Symbolic name, as printed by strace
    pub fn name(self) -> &'static str {
        match self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::ESRCH => "ESRCH",
            Errno::EINTR => "EINTR",
            Errno::EIO => "EIO",
            Errno::ENOEXEC => "ENOEXEC",
            Errno::EBADF => "EBADF",
            Errno::ECHILD => "ECHILD",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EACCES => "EACCES",
            Errno::EFAULT => "EFAULT",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::EINVAL => "EINVAL",
            Errno::EMFILE => "EMFILE",
            Errno::ESPIPE => "ESPIPE",
            Errno::EPIPE => "EPIPE",
            Errno::ENAMETOOLONG => "ENAMETOOLONG",
            Errno::ENOSYS => "ENOSYS",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::ELOOP => "ELOOP",
            Errno::ENOTSOCK => "ENOTSOCK",
            Errno::EDESTADDRREQ => "EDESTADDRREQ",
            Errno::EPROTONOSUPPORT => "EPROTONOSUPPORT",
            Errno::EOPNOTSUPP => "EOPNOTSUPP",
            Errno::EAFNOSUPPORT => "EAFNOSUPPORT",
            Errno::EADDRINUSE => "EADDRINUSE",
            Errno::EISCONN => "EISCONN",
            Errno::ENOTCONN => "ENOTCONN",
            Errno::ECONNREFUSED => "ECONNREFUSED",
        }
    }
}

/// Result type used by every kernel handler
pub type SyscallResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_linux() {
        assert_eq!(Errno::ENOENT.code(), 2);
        assert_eq!(Errno::EBADF.code(), 9);
        assert_eq!(Errno::ENOSYS.code(), 38);
        assert_eq!(Errno::ECONNREFUSED.code(), 111);
    }

    #[test]
    fn test_display() {
        assert_eq!(Errno::EACCES.to_string(), "permission denied");
        assert_eq!(Errno::EACCES.name(), "EACCES");
    }
}
