//! Filesystem, descriptor and socket syscalls
//!
//! Paths are resolved against the caller's cwd. Permission checks use the
//! caller's uid/gid against the owning node (or its parent directory for
//! create and remove).

use super::errno::{Errno, SyscallResult};
use super::files::{Handle, OpenObject};
use super::network::SocketId;
use super::process::{Fd, OpenFlags, Pid};
use super::syscall::Kernel;
use crate::vfs::{self, Access, DeviceKind, Metadata, NodeKind, NodeType};
use std::net::SocketAddrV4;

/// Write and search permission on a directory, needed to add or remove entries
const DIR_MODIFY: Access = Access {
    read: false,
    write: true,
    execute: true,
};

impl Kernel {
    // ========== DESCRIPTOR HELPERS ==========

    /// Look up the open-file handle behind a descriptor
    pub(super) fn fd_handle(&self, pid: Pid, fd: Fd) -> SyscallResult<Handle> {
        self.live(pid)?.files.get(fd).ok_or(Errno::EBADF)
    }

    fn fd_socket(&self, pid: Pid, fd: Fd) -> SyscallResult<SocketId> {
        let handle = self.fd_handle(pid, fd)?;
        self.files
            .get(handle)
            .ok_or(Errno::EBADF)?
            .socket()
            .ok_or(Errno::ENOTSOCK)
    }

    /// Install a fresh handle in the caller's table, undoing the open on EMFILE
    fn install_fd(&mut self, pid: Pid, handle: Handle) -> SyscallResult<Fd> {
        let allocated = self.live_mut(pid)?.files.alloc(handle);
        match allocated {
            Some(fd) => Ok(fd),
            None => {
                self.release_handle(handle);
                Err(Errno::EMFILE)
            }
        }
    }

    /// Drop one reference to an open file; the last reference closes
    /// whatever it points at
    pub(super) fn release_handle(&mut self, handle: Handle) {
        if let Some(closed) = self.files.release(handle) {
            if let OpenObject::Socket(id) = closed.object {
                self.network.close(id);
            }
        }
    }

    pub(super) fn is_stdin(&self, pid: Pid, fd: Fd) -> bool {
        self.fd_handle(pid, fd)
            .ok()
            .and_then(|h| self.files.get(h))
            .is_some_and(|f| f.object == OpenObject::Device(DeviceKind::Stdin))
    }

    fn credentials(&self, pid: Pid) -> SyscallResult<(String, u32, u32)> {
        let process = self.live(pid)?;
        Ok((process.cwd.clone(), process.uid, process.gid))
    }

    /// Check that the caller may add or remove entries in `dir`
    fn check_dir_modify(&self, dir: &str, uid: u32, gid: u32) -> SyscallResult<()> {
        let node = self.vfs.node(dir).ok_or(Errno::ENOENT)?;
        if !node.permits(uid, gid, DIR_MODIFY) {
            return Err(Errno::EACCES);
        }
        Ok(())
    }

    // ========== FILE I/O ==========

    pub(super) fn sys_open(&mut self, pid: Pid, path: &str, flags: OpenFlags, mode: u16) -> SyscallResult<Fd> {
        let (cwd, uid, gid) = self.credentials(pid)?;

        let mut created = false;
        let resolved = match self.vfs.resolve_as(&cwd, path, true, uid, gid) {
            Ok(_) if flags.create && flags.exclusive => return Err(Errno::EEXIST),
            Ok(resolved) => resolved,
            Err(Errno::ENOENT) if flags.create => {
                let (parent, name) = self.vfs.resolve_parent_as(&cwd, path, uid, gid)?;
                self.check_dir_modify(&parent, uid, gid)?;
                self.vfs.create_file(&parent, &name, mode & 0o7777, uid, gid)?;
                created = true;
                vfs::join(&parent, &name)
            }
            Err(err) => return Err(err),
        };

        let node = self.vfs.node(&resolved).ok_or(Errno::ENOENT)?;
        if flags.directory && !node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if node.is_dir() && (flags.write || flags.truncate) {
            return Err(Errno::EISDIR);
        }
        let access = Access {
            read: flags.read,
            write: flags.write || flags.truncate,
            execute: false,
        };
        if !created && !node.permits(uid, gid, access) {
            return Err(Errno::EACCES);
        }

        let object = match node.kind {
            NodeKind::Device(kind) => OpenObject::Device(kind),
            _ => OpenObject::File {
                path: resolved.clone(),
            },
        };
        if flags.truncate && matches!(object, OpenObject::File { .. }) {
            self.vfs.truncate(&resolved, 0)?;
        }

        let handle = self.files.open(object, flags);
        let fd = self.install_fd(pid, handle)?;
        tracing::trace!(%pid, path = %resolved, %fd, "open");
        Ok(fd)
    }

    pub(super) fn sys_read(&mut self, pid: Pid, fd: Fd, buf: &mut [u8]) -> SyscallResult<usize> {
        let handle = self.fd_handle(pid, fd)?;
        let entry = self.files.get(handle).ok_or(Errno::EBADF)?;
        if !entry.flags.read {
            return Err(Errno::EBADF);
        }
        let offset = entry.offset;

        match entry.object.clone() {
            OpenObject::File { path } => {
                let n = self.vfs.read_at(&path, offset, buf)?;
                if let Some(entry) = self.files.get_mut(handle) {
                    entry.offset += n as u64;
                }
                Ok(n)
            }
            OpenObject::Device(kind) => {
                let n = self.devices.read(kind, buf);
                // The host has not fed any input yet
                if kind == DeviceKind::Stdin && n == 0 && !buf.is_empty() {
                    return Err(Errno::EAGAIN);
                }
                Ok(n)
            }
            OpenObject::Socket(id) => self.network.recv(id, buf),
        }
    }

    pub(super) fn sys_write(&mut self, pid: Pid, fd: Fd, data: &[u8]) -> SyscallResult<usize> {
        let handle = self.fd_handle(pid, fd)?;
        let entry = self.files.get(handle).ok_or(Errno::EBADF)?;
        if !entry.flags.write {
            return Err(Errno::EBADF);
        }
        let append = entry.flags.append;
        let offset = entry.offset;

        match entry.object.clone() {
            OpenObject::File { path } => {
                let start = if append {
                    self.vfs.metadata(&path)?.size
                } else {
                    offset
                };
                let n = self.vfs.write_at(&path, start, data)?;
                if let Some(entry) = self.files.get_mut(handle) {
                    entry.offset = start + n as u64;
                }
                Ok(n)
            }
            OpenObject::Device(kind) => Ok(self.devices.write(kind, data)),
            OpenObject::Socket(id) => self.network.send(id, data),
        }
    }

    pub(super) fn sys_close(&mut self, pid: Pid, fd: Fd) -> SyscallResult<()> {
        let handle = self.live_mut(pid)?.files.remove(fd).ok_or(Errno::EBADF)?;
        self.release_handle(handle);
        Ok(())
    }

    pub(super) fn sys_lseek(&mut self, pid: Pid, fd: Fd, offset: i64, whence: u32) -> SyscallResult<u64> {
        use super::abi::seek::{SEEK_CUR, SEEK_END, SEEK_SET};

        let handle = self.fd_handle(pid, fd)?;
        let entry = self.files.get(handle).ok_or(Errno::EBADF)?;
        let size = match &entry.object {
            OpenObject::File { path } => self.vfs.metadata(path)?.size,
            // Character devices have no position
            OpenObject::Device(_) => return Ok(0),
            OpenObject::Socket(_) => return Err(Errno::ESPIPE),
        };

        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => entry.offset as i64,
            SEEK_END => size as i64,
            _ => return Err(Errno::EINVAL),
        };
        let target = base.checked_add(offset).filter(|t| *t >= 0).ok_or(Errno::EINVAL)?;

        if let Some(entry) = self.files.get_mut(handle) {
            entry.offset = target as u64;
        }
        Ok(target as u64)
    }

    pub(super) fn sys_dup(&mut self, pid: Pid, fd: Fd) -> SyscallResult<Fd> {
        let handle = self.fd_handle(pid, fd)?;
        if !self.files.retain(handle) {
            return Err(Errno::EBADF);
        }
        self.install_fd(pid, handle)
    }

    // ========== STATUS ==========

    pub(super) fn sys_stat(&mut self, pid: Pid, path: &str) -> SyscallResult<Metadata> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        let resolved = self.vfs.resolve_as(&cwd, path, true, uid, gid)?;
        self.vfs.metadata(&resolved)
    }

    pub(super) fn sys_lstat(&mut self, pid: Pid, path: &str) -> SyscallResult<Metadata> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        let resolved = self.vfs.resolve_as(&cwd, path, false, uid, gid)?;
        self.vfs.metadata(&resolved)
    }

    pub(super) fn sys_fstat(&mut self, pid: Pid, fd: Fd) -> SyscallResult<Metadata> {
        let handle = self.fd_handle(pid, fd)?;
        let entry = self.files.get(handle).ok_or(Errno::EBADF)?;
        match &entry.object {
            OpenObject::File { path } => self.vfs.metadata(path),
            OpenObject::Device(kind) => self.vfs.metadata(&vfs::join("/dev", kind.name())),
            OpenObject::Socket(id) => {
                let now = self.now();
                Ok(Metadata {
                    ino: 0,
                    node_type: NodeType::Socket,
                    mode: 0o777,
                    uid: self.live(pid)?.uid,
                    gid: self.live(pid)?.gid,
                    size: self.network.get(*id).map_or(0, |s| s.pending_bytes() as u64),
                    nlink: 1,
                    atime: now,
                    mtime: now,
                    ctime: now,
                })
            }
        }
    }

    // ========== FILESYSTEM ==========

    pub(super) fn sys_getcwd(&mut self, pid: Pid) -> SyscallResult<String> {
        Ok(self.live(pid)?.cwd.clone())
    }

    pub(super) fn sys_chdir(&mut self, pid: Pid, path: &str) -> SyscallResult<()> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        let resolved = self.vfs.resolve_as(&cwd, path, true, uid, gid)?;
        let node = self.vfs.node(&resolved).ok_or(Errno::ENOENT)?;
        if !node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if !node.permits(uid, gid, Access::EXECUTE) {
            return Err(Errno::EACCES);
        }
        self.live_mut(pid)?.cwd = resolved;
        Ok(())
    }

    pub(super) fn sys_mkdir(&mut self, pid: Pid, path: &str, mode: u16) -> SyscallResult<()> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        let (parent, name) = self.vfs.resolve_parent_as(&cwd, path, uid, gid)?;
        self.check_dir_modify(&parent, uid, gid)?;
        self.vfs.create_dir(&parent, &name, mode & 0o7777, uid, gid)
    }

    pub(super) fn sys_rmdir(&mut self, pid: Pid, path: &str) -> SyscallResult<()> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        if self.vfs.resolve_as(&cwd, path, false, uid, gid)? == "/" {
            return Err(Errno::EBUSY);
        }
        let (parent, name) = self.vfs.resolve_parent_as(&cwd, path, uid, gid)?;
        self.check_dir_modify(&parent, uid, gid)?;
        let target = vfs::join(&parent, &name);
        if self.files.is_open(&target) || self.processes.values().any(|p| p.is_alive() && p.cwd == target) {
            return Err(Errno::EBUSY);
        }
        self.vfs.remove(&parent, &name, true)
    }

    pub(super) fn sys_unlink(&mut self, pid: Pid, path: &str) -> SyscallResult<()> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        let (parent, name) = self.vfs.resolve_parent_as(&cwd, path, uid, gid)?;
        self.check_dir_modify(&parent, uid, gid)?;
        // Open files have no inode to outlive their name
        if self.files.is_open(&vfs::join(&parent, &name)) {
            return Err(Errno::EBUSY);
        }
        self.vfs.remove(&parent, &name, false)
    }

    pub(super) fn sys_symlink(&mut self, pid: Pid, target: &str, link: &str) -> SyscallResult<()> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        let (parent, name) = self.vfs.resolve_parent_as(&cwd, link, uid, gid)?;
        self.check_dir_modify(&parent, uid, gid)?;
        self.vfs.create_symlink(&parent, &name, target, uid, gid)
    }

    pub(super) fn sys_readlink(&mut self, pid: Pid, path: &str) -> SyscallResult<String> {
        let (cwd, uid, gid) = self.credentials(pid)?;
        let resolved = self.vfs.resolve_as(&cwd, path, false, uid, gid)?;
        self.vfs.read_link(&resolved)
    }

    // ========== SOCKETS ==========

    pub(super) fn sys_socket(&mut self, pid: Pid, family: u32, ty: u32, protocol: u32) -> SyscallResult<Fd> {
        self.live(pid)?;
        let id = self.network.socket(family, ty, protocol)?;
        let handle = self.files.open(OpenObject::Socket(id), OpenFlags::RDWR);
        self.install_fd(pid, handle)
    }

    pub(super) fn sys_bind(&mut self, pid: Pid, fd: Fd, addr: SocketAddrV4) -> SyscallResult<()> {
        let id = self.fd_socket(pid, fd)?;
        self.network.bind(id, addr)
    }

    pub(super) fn sys_listen(&mut self, pid: Pid, fd: Fd, backlog: usize) -> SyscallResult<()> {
        let id = self.fd_socket(pid, fd)?;
        self.network.listen(id, backlog)
    }

    pub(super) fn sys_connect(&mut self, pid: Pid, fd: Fd, addr: SocketAddrV4) -> SyscallResult<()> {
        let id = self.fd_socket(pid, fd)?;
        self.network.connect(id, addr)
    }

    pub(super) fn sys_accept(&mut self, pid: Pid, fd: Fd) -> SyscallResult<(Fd, Option<SocketAddrV4>)> {
        let id = self.fd_socket(pid, fd)?;
        let (conn, peer) = self.network.accept(id)?;
        let handle = self.files.open(OpenObject::Socket(conn), OpenFlags::RDWR);
        Ok((self.install_fd(pid, handle)?, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::KernelConfig;
    use crate::kernel::wasm::ValidatingLoader;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn kernel() -> Kernel {
        Kernel::boot(
            KernelConfig::default(),
            Arc::new(ManualClock::new()),
            Box::new(ValidatingLoader),
        )
        .expect("boot")
    }

    fn rw_create() -> OpenFlags {
        OpenFlags {
            create: true,
            ..OpenFlags::RDWR
        }
    }

    #[test]
    fn test_open_write_read_roundtrip() {
        let mut k = kernel();
        let fd = k.sys_open(Pid::INIT, "/tmp/a.txt", rw_create(), 0o644).unwrap();
        assert_eq!(k.sys_write(Pid::INIT, fd, b"hello").unwrap(), 5);
        assert_eq!(k.sys_lseek(Pid::INIT, fd, 0, 0).unwrap(), 0);

        let mut buf = [0u8; 16];
        assert_eq!(k.sys_read(Pid::INIT, fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // EOF
        assert_eq!(k.sys_read(Pid::INIT, fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_open_errors() {
        let mut k = kernel();
        assert_eq!(
            k.sys_open(Pid::INIT, "/missing", OpenFlags::READ, 0),
            Err(Errno::ENOENT)
        );
        assert_eq!(
            k.sys_open(Pid::INIT, "/tmp", OpenFlags::WRITE, 0),
            Err(Errno::EISDIR)
        );
        k.sys_open(Pid::INIT, "/tmp/x", rw_create(), 0o644).unwrap();
        let excl = OpenFlags {
            exclusive: true,
            ..rw_create()
        };
        assert_eq!(k.sys_open(Pid::INIT, "/tmp/x", excl, 0o644), Err(Errno::EEXIST));
        let dir_only = OpenFlags {
            directory: true,
            ..OpenFlags::READ
        };
        assert_eq!(k.sys_open(Pid::INIT, "/tmp/x", dir_only, 0), Err(Errno::ENOTDIR));
    }

    #[test]
    fn test_wrong_mode_is_ebadf() {
        let mut k = kernel();
        let fd = k.sys_open(Pid::INIT, "/tmp/f", rw_create(), 0o644).unwrap();
        k.sys_close(Pid::INIT, fd).unwrap();

        let ro = k.sys_open(Pid::INIT, "/tmp/f", OpenFlags::READ, 0).unwrap();
        assert_eq!(k.sys_write(Pid::INIT, ro, b"x"), Err(Errno::EBADF));
        assert_eq!(k.sys_close(Pid::INIT, Fd(99)), Err(Errno::EBADF));
    }

    #[test]
    fn test_append_and_truncate() {
        let mut k = kernel();
        k.vfs_mut().write_file("/tmp/log", b"abc", 0o644).unwrap();
        let append = OpenFlags {
            append: true,
            truncate: false,
            ..OpenFlags::WRITE
        };
        let fd = k.sys_open(Pid::INIT, "/tmp/log", append, 0).unwrap();
        k.sys_write(Pid::INIT, fd, b"def").unwrap();
        assert_eq!(k.vfs().read_file("/tmp/log").unwrap(), b"abcdef");

        let trunc = OpenFlags {
            truncate: true,
            ..OpenFlags::WRITE
        };
        k.sys_open(Pid::INIT, "/tmp/log", trunc, 0).unwrap();
        assert!(k.vfs().read_file("/tmp/log").unwrap().is_empty());
    }

    #[test]
    fn test_dup_shares_offset() {
        let mut k = kernel();
        k.vfs_mut().write_file("/tmp/d", b"0123456789", 0o644).unwrap();
        let fd = k.sys_open(Pid::INIT, "/tmp/d", OpenFlags::READ, 0).unwrap();
        let dup = k.sys_dup(Pid::INIT, fd).unwrap();
        assert_ne!(fd, dup);

        let mut buf = [0u8; 4];
        k.sys_read(Pid::INIT, fd, &mut buf).unwrap();
        k.sys_read(Pid::INIT, dup, &mut buf).unwrap();
        assert_eq!(&buf, b"4567");

        k.sys_close(Pid::INIT, fd).unwrap();
        assert_eq!(k.sys_read(Pid::INIT, dup, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_lseek_bounds() {
        let mut k = kernel();
        k.vfs_mut().write_file("/tmp/s", b"12345", 0o644).unwrap();
        let fd = k.sys_open(Pid::INIT, "/tmp/s", OpenFlags::READ, 0).unwrap();
        assert_eq!(k.sys_lseek(Pid::INIT, fd, -2, 2).unwrap(), 3);
        assert_eq!(k.sys_lseek(Pid::INIT, fd, -10, 1), Err(Errno::EINVAL));
        assert_eq!(k.sys_lseek(Pid::INIT, fd, 0, 9), Err(Errno::EINVAL));
    }

    #[test]
    fn test_stdio_devices() {
        let mut k = kernel();
        k.sys_write(Pid::INIT, Fd::STDOUT, b"out").unwrap();
        assert_eq!(k.take_stdout(), b"out");

        let mut buf = [0u8; 8];
        assert_eq!(k.sys_read(Pid::INIT, Fd::STDIN, &mut buf), Err(Errno::EAGAIN));
        k.push_stdin(b"ls\n");
        assert_eq!(k.sys_read(Pid::INIT, Fd::STDIN, &mut buf).unwrap(), 3);
        assert!(k.is_stdin(Pid::INIT, Fd::STDIN));
        assert!(!k.is_stdin(Pid::INIT, Fd::STDOUT));
    }

    #[test]
    fn test_directory_operations() {
        let mut k = kernel();
        k.sys_mkdir(Pid::INIT, "/tmp/work", 0o755).unwrap();
        assert_eq!(k.sys_mkdir(Pid::INIT, "/tmp/work", 0o755), Err(Errno::EEXIST));

        k.sys_chdir(Pid::INIT, "/tmp/work").unwrap();
        assert_eq!(k.sys_getcwd(Pid::INIT).unwrap(), "/tmp/work");
        k.sys_open(Pid::INIT, "notes", rw_create(), 0o644).unwrap();
        assert!(k.vfs().exists("/tmp/work/notes"));

        k.sys_chdir(Pid::INIT, "/").unwrap();
        assert_eq!(k.sys_rmdir(Pid::INIT, "/tmp/work"), Err(Errno::ENOTEMPTY));
        assert_eq!(k.sys_chdir(Pid::INIT, "/tmp/work/notes"), Err(Errno::ENOTDIR));
        assert_eq!(k.sys_rmdir(Pid::INIT, "/"), Err(Errno::EBUSY));
    }

    #[test]
    fn test_unlink_rules() {
        let mut k = kernel();
        let fd = k.sys_open(Pid::INIT, "/tmp/u", rw_create(), 0o644).unwrap();
        assert_eq!(k.sys_unlink(Pid::INIT, "/tmp/u"), Err(Errno::EBUSY));
        k.sys_close(Pid::INIT, fd).unwrap();
        k.sys_unlink(Pid::INIT, "/tmp/u").unwrap();
        assert!(!k.vfs().exists("/tmp/u"));
        assert_eq!(k.sys_unlink(Pid::INIT, "/tmp"), Err(Errno::EISDIR));
    }

    #[test]
    fn test_symlinks() {
        let mut k = kernel();
        k.vfs_mut().write_file("/tmp/real", b"data", 0o644).unwrap();
        k.sys_symlink(Pid::INIT, "/tmp/real", "/tmp/link").unwrap();

        assert_eq!(k.sys_readlink(Pid::INIT, "/tmp/link").unwrap(), "/tmp/real");
        assert_eq!(k.sys_stat(Pid::INIT, "/tmp/link").unwrap().node_type, NodeType::File);
        assert_eq!(k.sys_lstat(Pid::INIT, "/tmp/link").unwrap().node_type, NodeType::Symlink);
        assert_eq!(k.sys_readlink(Pid::INIT, "/tmp/real"), Err(Errno::EINVAL));
    }

    #[test]
    fn test_fstat_device() {
        let mut k = kernel();
        let meta = k.sys_fstat(Pid::INIT, Fd::STDOUT).unwrap();
        assert_eq!(meta.node_type, NodeType::Device);
    }

    #[test]
    fn test_socket_fd_lifecycle() {
        let mut k = kernel();
        let server = k.sys_socket(Pid::INIT, 2, 1, 0).unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080);
        k.sys_bind(Pid::INIT, server, addr).unwrap();
        k.sys_listen(Pid::INIT, server, 4).unwrap();

        let client = k.sys_socket(Pid::INIT, 2, 1, 0).unwrap();
        k.sys_connect(Pid::INIT, client, addr).unwrap();
        let (conn, _) = k.sys_accept(Pid::INIT, server).unwrap();

        k.sys_write(Pid::INIT, client, b"ping").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(k.sys_read(Pid::INIT, conn, &mut buf).unwrap(), 4);
        assert_eq!(k.sys_lseek(Pid::INIT, conn, 0, 0), Err(Errno::ESPIPE));

        k.sys_close(Pid::INIT, client).unwrap();
        assert_eq!(k.sys_read(Pid::INIT, conn, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_socket_calls_on_file_fd() {
        let mut k = kernel();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
        assert_eq!(k.sys_bind(Pid::INIT, Fd::STDOUT, addr), Err(Errno::ENOTSOCK));
    }

    #[test]
    fn test_fd_limit() {
        let config = KernelConfig {
            max_fds_per_process: 4,
            ..KernelConfig::default()
        };
        let mut k = Kernel::boot(config, Arc::new(ManualClock::new()), Box::new(ValidatingLoader)).unwrap();
        k.vfs_mut().write_file("/tmp/f", b"", 0o644).unwrap();
        k.sys_open(Pid::INIT, "/tmp/f", OpenFlags::READ, 0).unwrap();
        assert_eq!(k.sys_open(Pid::INIT, "/tmp/f", OpenFlags::READ, 0), Err(Errno::EMFILE));
        assert!(!k.open_files().is_empty());
    }

    #[test]
    fn test_permission_denied_for_other_user() {
        let mut k = kernel();
        k.vfs_mut().write_file("/tmp/secret", b"x", 0o600).unwrap();
        let child = k.sys_fork(Pid::INIT).unwrap();
        k.process_mut(child).unwrap().uid = 1000;
        assert_eq!(
            k.sys_open(child, "/tmp/secret", OpenFlags::READ, 0),
            Err(Errno::EACCES)
        );
        // /tmp is world-writable
        k.sys_open(child, "/tmp/mine", rw_create(), 0o600).unwrap();
        assert_eq!(k.vfs().metadata("/tmp/mine").unwrap().uid, 1000);
    }

    #[test]
    fn test_lookup_needs_search_permission() {
        let mut k = kernel();
        k.vfs_mut().write_file("/root/secret", b"top secret", 0o644).unwrap();
        let child = k.sys_fork(Pid::INIT).unwrap();
        let process = k.process_mut(child).unwrap();
        process.uid = 1000;
        process.gid = 1000;

        // /root is 0700, so nothing below it is reachable
        assert_eq!(k.sys_open(child, "/root/secret", OpenFlags::READ, 0), Err(Errno::EACCES));
        assert_eq!(k.sys_stat(child, "/root/secret"), Err(Errno::EACCES));
        assert_eq!(k.sys_open(child, "/root/new", rw_create(), 0o644), Err(Errno::EACCES));
        assert_eq!(k.sys_unlink(child, "/root/secret"), Err(Errno::EACCES));
        assert_eq!(k.sys_chdir(child, "/root"), Err(Errno::EACCES));

        // root is not subject to mode bits
        assert_eq!(k.sys_stat(Pid::INIT, "/root/secret").unwrap().size, 10);
    }
}
