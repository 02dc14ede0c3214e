//! In-memory filesystem tree
//!
//! Paths handed to the mutating methods are canonical (absolute, no
//! symlinks, no `.`/`..`); callers obtain them from `resolve` or
//! `resolve_parent`, which perform the component walk.

use super::{
    Access, DeviceKind, Metadata, NodeKind, VfsNode, MAX_SYMLINK_HOPS, PATH_MAX, components,
    join_components,
};
use crate::kernel::errno::{Errno, SyscallResult};
use std::collections::{BTreeMap, VecDeque};

/// In-memory filesystem
pub struct MemoryFs {
    root: VfsNode,
    next_ino: u64,
    /// Filesystem clock used for timestamps
    now: f64,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self {
            // Root directory always exists and is inode 1
            root: VfsNode::new("/", NodeKind::Directory(BTreeMap::new()), 0o755, 0, 0, 1, 0.0),
            next_ino: 2,
            now: 0.0,
        }
    }

    /// Set the clock used for timestamp updates
    pub fn set_clock(&mut self, now: f64) {
        self.now = now;
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn node_at(&self, parts: &[String]) -> Option<&VfsNode> {
        let mut node = &self.root;
        for part in parts {
            node = node.children()?.get(part)?;
        }
        Some(node)
    }

    /// Look up a canonical path without following symlinks
    pub fn node(&self, path: &str) -> Option<&VfsNode> {
        let mut node = &self.root;
        for part in components(path) {
            node = node.children()?.get(part)?;
        }
        Some(node)
    }

    pub fn node_mut(&mut self, path: &str) -> Option<&mut VfsNode> {
        let mut node = &mut self.root;
        for part in components(path) {
            node = node.children_mut()?.get_mut(part)?;
        }
        Some(node)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    /// Resolve `path` relative to `cwd` into a canonical absolute path.
    ///
    /// Intermediate symlinks are always followed; the final component is
    /// followed only when `follow_final` is set (stat vs lstat). No
    /// permission checks: this is the host's view of the tree.
    pub fn resolve(&self, cwd: &str, path: &str, follow_final: bool) -> SyscallResult<String> {
        self.walk(cwd, path, follow_final, None)
    }

    /// `resolve` on behalf of a guest: every directory searched along the
    /// way must grant execute to `uid`/`gid`, otherwise EACCES
    pub fn resolve_as(&self, cwd: &str, path: &str, follow_final: bool, uid: u32, gid: u32) -> SyscallResult<String> {
        self.walk(cwd, path, follow_final, Some((uid, gid)))
    }

    fn walk(&self, cwd: &str, path: &str, follow_final: bool, searcher: Option<(u32, u32)>) -> SyscallResult<String> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        if path.len() > PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        let mut pending: VecDeque<String> = if path.starts_with('/') {
            components(path).map(str::to_string).collect()
        } else {
            components(cwd)
                .chain(components(path))
                .map(str::to_string)
                .collect()
        };
        let mut resolved: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(part) = pending.pop_front() {
            if part == ".." {
                resolved.pop();
                continue;
            }
            let is_final = pending.is_empty();
            let dir = self.node_at(&resolved).ok_or(Errno::ENOENT)?;
            let children = dir.children().ok_or(Errno::ENOTDIR)?;
            if let Some((uid, gid)) = searcher {
                if !dir.permits(uid, gid, Access::EXECUTE) {
                    return Err(Errno::EACCES);
                }
            }
            let child = children.get(&part).ok_or(Errno::ENOENT)?;

            if let NodeKind::Symlink(target) = &child.kind {
                if !is_final || follow_final {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(Errno::ELOOP);
                    }
                    if target.starts_with('/') {
                        resolved.clear();
                    }
                    let mut expanded: VecDeque<String> =
                        components(target).map(str::to_string).collect();
                    expanded.extend(pending.drain(..));
                    pending = expanded;
                    continue;
                }
            }
            resolved.push(part);
        }

        Ok(join_components(&resolved))
    }

    /// Resolve the parent directory of `path`, returning (parent, name).
    /// The final component itself need not exist.
    pub fn resolve_parent(&self, cwd: &str, path: &str) -> SyscallResult<(String, String)> {
        self.walk_parent(cwd, path, None)
    }

    /// `resolve_parent` with search permission checked up to and
    /// including the parent itself
    pub fn resolve_parent_as(&self, cwd: &str, path: &str, uid: u32, gid: u32) -> SyscallResult<(String, String)> {
        self.walk_parent(cwd, path, Some((uid, gid)))
    }

    fn walk_parent(&self, cwd: &str, path: &str, searcher: Option<(u32, u32)>) -> SyscallResult<(String, String)> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(Errno::EEXIST);
        }
        let (parent, name) = match trimmed.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((parent, name)) => (parent, name),
            None => (".", trimmed),
        };
        if name == "." || name == ".." {
            return Err(Errno::EEXIST);
        }
        if name.len() > 255 {
            return Err(Errno::ENAMETOOLONG);
        }
        let parent = self.walk(cwd, parent, true, searcher)?;
        match self.node(&parent) {
            Some(node) if node.is_dir() => {
                if let Some((uid, gid)) = searcher {
                    if !node.permits(uid, gid, Access::EXECUTE) {
                        return Err(Errno::EACCES);
                    }
                }
                Ok((parent, name.to_string()))
            }
            Some(_) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn insert_child(&mut self, parent: &str, name: &str, kind: NodeKind, mode: u16, uid: u32, gid: u32) -> SyscallResult<()> {
        let ino = self.alloc_ino();
        let now = self.now;
        let dir = self.node_mut(parent).ok_or(Errno::ENOENT)?;
        let children = dir.children_mut().ok_or(Errno::ENOTDIR)?;
        if children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        children.insert(name.to_string(), VfsNode::new(name, kind, mode, uid, gid, ino, now));
        dir.modified = now;
        Ok(())
    }

    pub fn create_file(&mut self, parent: &str, name: &str, mode: u16, uid: u32, gid: u32) -> SyscallResult<()> {
        self.insert_child(parent, name, NodeKind::File(Vec::new()), mode, uid, gid)
    }

    pub fn create_dir(&mut self, parent: &str, name: &str, mode: u16, uid: u32, gid: u32) -> SyscallResult<()> {
        self.insert_child(parent, name, NodeKind::Directory(BTreeMap::new()), mode, uid, gid)
    }

    pub fn create_symlink(&mut self, parent: &str, name: &str, target: &str, uid: u32, gid: u32) -> SyscallResult<()> {
        self.insert_child(parent, name, NodeKind::Symlink(target.to_string()), 0o777, uid, gid)
    }

    pub fn create_device(&mut self, parent: &str, name: &str, device: DeviceKind, mode: u16) -> SyscallResult<()> {
        self.insert_child(parent, name, NodeKind::Device(device), mode, 0, 0)
    }

    /// Create every missing directory along an absolute path (boot helper)
    pub fn create_dir_all(&mut self, path: &str, mode: u16) -> SyscallResult<()> {
        let mut current = String::from("/");
        for part in components(path) {
            let next = if current == "/" {
                format!("/{}", part)
            } else {
                format!("{}/{}", current, part)
            };
            match self.node(&next) {
                Some(node) if node.is_dir() => {}
                Some(_) => return Err(Errno::ENOTDIR),
                None => self.create_dir(&current, part, mode, 0, 0)?,
            }
            current = next;
        }
        Ok(())
    }

    /// Write a whole file, creating it if needed (boot helper)
    pub fn write_file(&mut self, path: &str, data: &[u8], mode: u16) -> SyscallResult<()> {
        if !self.exists(path) {
            let (parent, name) = self.resolve_parent("/", path)?;
            self.create_file(&parent, &name, mode, 0, 0)?;
        }
        self.truncate(path, 0)?;
        self.write_at(path, 0, data).map(|_| ())
    }

    /// Remove a directory entry. Directories must be empty.
    pub fn remove(&mut self, parent: &str, name: &str, expect_dir: bool) -> SyscallResult<()> {
        let now = self.now;
        let dir = self.node_mut(parent).ok_or(Errno::ENOENT)?;
        let children = dir.children_mut().ok_or(Errno::ENOTDIR)?;
        let child = children.get(name).ok_or(Errno::ENOENT)?;
        match (&child.kind, expect_dir) {
            (NodeKind::Directory(grandchildren), true) => {
                if !grandchildren.is_empty() {
                    return Err(Errno::ENOTEMPTY);
                }
            }
            (NodeKind::Directory(_), false) => return Err(Errno::EISDIR),
            (_, true) => return Err(Errno::ENOTDIR),
            (_, false) => {}
        }
        children.remove(name);
        dir.modified = now;
        Ok(())
    }

    /// Read file content at `offset`; returns bytes copied (0 at EOF)
    pub fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> SyscallResult<usize> {
        let now = self.now;
        let node = self.node_mut(path).ok_or(Errno::ENOENT)?;
        let data = match &node.kind {
            NodeKind::File(data) => data,
            NodeKind::Directory(_) => return Err(Errno::EISDIR),
            _ => return Err(Errno::EINVAL),
        };
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        node.accessed = now;
        Ok(n)
    }

    /// Write at `offset`, growing the file (zero-filled) as needed
    pub fn write_at(&mut self, path: &str, offset: u64, buf: &[u8]) -> SyscallResult<usize> {
        let now = self.now;
        let node = self.node_mut(path).ok_or(Errno::ENOENT)?;
        let data = match &mut node.kind {
            NodeKind::File(data) => data,
            NodeKind::Directory(_) => return Err(Errno::EISDIR),
            _ => return Err(Errno::EINVAL),
        };
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Errno::EINVAL)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        node.modified = now;
        Ok(buf.len())
    }

    pub fn truncate(&mut self, path: &str, len: u64) -> SyscallResult<()> {
        let now = self.now;
        let node = self.node_mut(path).ok_or(Errno::ENOENT)?;
        match &mut node.kind {
            NodeKind::File(data) => {
                data.resize(len as usize, 0);
                node.modified = now;
                Ok(())
            }
            NodeKind::Directory(_) => Err(Errno::EISDIR),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Whole-file content (for program loading)
    pub fn read_file(&self, path: &str) -> SyscallResult<Vec<u8>> {
        match &self.node(path).ok_or(Errno::ENOENT)?.kind {
            NodeKind::File(data) => Ok(data.clone()),
            NodeKind::Directory(_) => Err(Errno::EISDIR),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn metadata(&self, path: &str) -> SyscallResult<Metadata> {
        self.node(path).map(VfsNode::metadata).ok_or(Errno::ENOENT)
    }

    pub fn read_dir(&self, path: &str) -> SyscallResult<Vec<String>> {
        let node = self.node(path).ok_or(Errno::ENOENT)?;
        let children = node.children().ok_or(Errno::ENOTDIR)?;
        Ok(children.keys().cloned().collect())
    }

    pub fn read_link(&self, path: &str) -> SyscallResult<String> {
        match &self.node(path).ok_or(Errno::ENOENT)?.kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn chmod(&mut self, path: &str, mode: u16) -> SyscallResult<()> {
        let now = self.now;
        let node = self.node_mut(path).ok_or(Errno::ENOENT)?;
        node.mode = mode & 0o7777;
        node.modified = now;
        Ok(())
    }

    /// Total number of nodes, root included
    pub fn node_count(&self) -> usize {
        fn count(node: &VfsNode) -> usize {
            1 + node
                .children()
                .map(|c| c.values().map(count).sum())
                .unwrap_or(0)
        }
        count(&self.root)
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::NodeType;

    fn fs_with_tmp() -> MemoryFs {
        let mut fs = MemoryFs::new();
        fs.create_dir_all("/tmp", 0o777).unwrap();
        fs.create_dir_all("/home/user", 0o755).unwrap();
        fs
    }

    #[test]
    fn test_create_and_read_write() {
        let mut fs = fs_with_tmp();
        fs.create_file("/tmp", "a.txt", 0o644, 0, 0).unwrap();
        fs.write_at("/tmp/a.txt", 0, b"hello").unwrap();
        fs.write_at("/tmp/a.txt", 7, b"!").unwrap();

        let mut buf = [0u8; 16];
        let n = fs.read_at("/tmp/a.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\0\0!");
        assert_eq!(fs.read_at("/tmp/a.txt", 8, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_create_existing_fails() {
        let mut fs = fs_with_tmp();
        fs.create_file("/tmp", "x", 0o644, 0, 0).unwrap();
        assert_eq!(fs.create_file("/tmp", "x", 0o644, 0, 0), Err(Errno::EEXIST));
    }

    #[test]
    fn test_resolve_relative_and_dotdot() {
        let fs = fs_with_tmp();
        assert_eq!(fs.resolve("/home/user", "../../tmp", true).unwrap(), "/tmp");
        assert_eq!(fs.resolve("/home", "./user/.", true).unwrap(), "/home/user");
        assert_eq!(fs.resolve("/", "/../..", true).unwrap(), "/");
        assert_eq!(fs.resolve("/", "/missing", true), Err(Errno::ENOENT));
    }

    #[test]
    fn test_resolve_as_checks_every_directory() {
        let mut fs = fs_with_tmp();
        fs.create_dir_all("/home/alice/docs", 0o755).unwrap();
        fs.chmod("/home/alice", 0o700).unwrap();
        fs.create_file("/home/alice/docs", "plan", 0o644, 0, 0).unwrap();

        assert_eq!(
            fs.resolve_as("/", "/home/alice/docs/plan", true, 1000, 1000),
            Err(Errno::EACCES)
        );
        assert_eq!(
            fs.resolve_parent_as("/", "/home/alice/new", 1000, 1000),
            Err(Errno::EACCES)
        );
        // the owner (uid 0 here) and the host view both get through
        assert_eq!(fs.resolve_as("/", "/home/alice/docs/plan", true, 0, 0).unwrap(), "/home/alice/docs/plan");
        assert!(fs.resolve("/", "/home/alice/docs/plan", true).is_ok());
    }

    #[test]
    fn test_resolve_through_file_is_enotdir() {
        let mut fs = fs_with_tmp();
        fs.create_file("/tmp", "f", 0o644, 0, 0).unwrap();
        assert_eq!(fs.resolve("/", "/tmp/f/x", true), Err(Errno::ENOTDIR));
    }

    #[test]
    fn test_symlink_follow_and_lstat() {
        let mut fs = fs_with_tmp();
        fs.create_file("/tmp", "target", 0o644, 0, 0).unwrap();
        fs.create_symlink("/tmp", "link", "target", 0, 0).unwrap();
        fs.create_symlink("/", "t", "/tmp", 0, 0).unwrap();

        assert_eq!(fs.resolve("/", "/tmp/link", true).unwrap(), "/tmp/target");
        assert_eq!(fs.resolve("/", "/tmp/link", false).unwrap(), "/tmp/link");
        assert_eq!(fs.resolve("/", "/t/target", false).unwrap(), "/tmp/target");
        assert_eq!(fs.metadata("/tmp/link").unwrap().node_type, NodeType::Symlink);
    }

    #[test]
    fn test_symlink_loop() {
        let mut fs = fs_with_tmp();
        fs.create_symlink("/tmp", "a", "/tmp/b", 0, 0).unwrap();
        fs.create_symlink("/tmp", "b", "/tmp/a", 0, 0).unwrap();
        assert_eq!(fs.resolve("/", "/tmp/a", true), Err(Errno::ELOOP));
    }

    #[test]
    fn test_resolve_parent() {
        let fs = fs_with_tmp();
        assert_eq!(
            fs.resolve_parent("/home", "user/new.txt").unwrap(),
            ("/home/user".to_string(), "new.txt".to_string())
        );
        assert_eq!(
            fs.resolve_parent("/", "/top").unwrap(),
            ("/".to_string(), "top".to_string())
        );
        assert_eq!(fs.resolve_parent("/", "/nope/x"), Err(Errno::ENOENT));
        assert_eq!(fs.resolve_parent("/", "/"), Err(Errno::EEXIST));
    }

    #[test]
    fn test_remove_rules() {
        let mut fs = fs_with_tmp();
        fs.create_file("/home/user", "f", 0o644, 0, 0).unwrap();
        assert_eq!(fs.remove("/home", "user", true), Err(Errno::ENOTEMPTY));
        assert_eq!(fs.remove("/home/user", "f", true), Err(Errno::ENOTDIR));
        assert_eq!(fs.remove("/home", "user", false), Err(Errno::EISDIR));
        fs.remove("/home/user", "f", false).unwrap();
        fs.remove("/home", "user", true).unwrap();
        assert!(!fs.exists("/home/user"));
    }

    #[test]
    fn test_timestamps_follow_clock() {
        let mut fs = fs_with_tmp();
        fs.set_clock(5.0);
        fs.create_file("/tmp", "t", 0o644, 0, 0).unwrap();
        fs.set_clock(9.0);
        fs.write_at("/tmp/t", 0, b"x").unwrap();
        let meta = fs.metadata("/tmp/t").unwrap();
        assert_eq!(meta.ctime, 5.0);
        assert_eq!(meta.mtime, 9.0);
        assert_eq!(meta.size, 1);
    }

    #[test]
    fn test_inodes_unique() {
        let mut fs = fs_with_tmp();
        fs.create_file("/tmp", "a", 0o644, 0, 0).unwrap();
        fs.create_file("/tmp", "b", 0o644, 0, 0).unwrap();
        assert_ne!(
            fs.metadata("/tmp/a").unwrap().ino,
            fs.metadata("/tmp/b").unwrap().ino
        );
    }
}
