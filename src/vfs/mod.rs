//! Virtual File System
//!
//! An in-memory tree emulating a POSIX directory hierarchy. Directories
//! exclusively own their children, so the tree has no back-edges and cannot
//! contain cycles; symlinks are stored as target strings and resolved by
//! path walking.

pub mod memory;

pub use memory::MemoryFs;

use crate::kernel::abi::mode;
use serde::Serialize;
use std::collections::BTreeMap;

/// Longest path accepted by the resolver
pub const PATH_MAX: usize = 4096;

/// Symlink hops before resolution fails with ELOOP
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Character devices available under /dev
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceKind {
    Null,
    Zero,
    Random,
    Urandom,
    Stdin,
    Stdout,
    Stderr,
}

impl DeviceKind {
    /// Linux (major, minor) numbers, for display
    pub fn numbers(self) -> (u32, u32) {
        match self {
            DeviceKind::Null => (1, 3),
            DeviceKind::Zero => (1, 5),
            DeviceKind::Random => (1, 8),
            DeviceKind::Urandom => (1, 9),
            DeviceKind::Stdin => (5, 0),
            DeviceKind::Stdout => (5, 1),
            DeviceKind::Stderr => (5, 2),
        }
    }

    /// Entry name under /dev
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Null => "null",
            DeviceKind::Zero => "zero",
            DeviceKind::Random => "random",
            DeviceKind::Urandom => "urandom",
            DeviceKind::Stdin => "stdin",
            DeviceKind::Stdout => "stdout",
            DeviceKind::Stderr => "stderr",
        }
    }

    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::Null,
        DeviceKind::Zero,
        DeviceKind::Random,
        DeviceKind::Urandom,
        DeviceKind::Stdin,
        DeviceKind::Stdout,
        DeviceKind::Stderr,
    ];
}

/// Node payload: exactly one per node
#[derive(Debug, Clone)]
pub enum NodeKind {
    File(Vec<u8>),
    Directory(BTreeMap<String, VfsNode>),
    Symlink(String),
    Device(DeviceKind),
}

/// Type tag of a node, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeType {
    File,
    Directory,
    Symlink,
    Device,
    /// Never stored in the tree; reported by fstat on socket descriptors
    Socket,
}

/// Requested access, checked against permission bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Access {
    pub const READ: Access = Access {
        read: true,
        write: false,
        execute: false,
    };

    pub const WRITE: Access = Access {
        read: false,
        write: true,
        execute: false,
    };

    pub const EXECUTE: Access = Access {
        read: false,
        write: false,
        execute: true,
    };
}

/// A filesystem node
#[derive(Debug, Clone)]
pub struct VfsNode {
    pub name: String,
    pub kind: NodeKind,
    /// Permission bits (rwxrwxrwx plus setuid/setgid/sticky)
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
    pub created: f64,
    pub modified: f64,
    pub accessed: f64,
}

impl VfsNode {
    pub fn new(name: &str, kind: NodeKind, mode: u16, uid: u32, gid: u32, ino: u64, now: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            mode: mode & 0o7777,
            uid,
            gid,
            ino,
            created: now,
            modified: now,
            accessed: now,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::File(_) => NodeType::File,
            NodeKind::Directory(_) => NodeType::Directory,
            NodeKind::Symlink(_) => NodeType::Symlink,
            NodeKind::Device(_) => NodeType::Device,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Symlink(target) => target.len() as u64,
            NodeKind::Directory(_) | NodeKind::Device(_) => 0,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, VfsNode>> {
        match &self.kind {
            NodeKind::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, VfsNode>> {
        match &mut self.kind {
            NodeKind::Directory(children) => Some(children),
            _ => None,
        }
    }

    /// Check owner/group/other permission bits; uid 0 bypasses read/write
    /// checks and needs at least one execute bit to execute
    pub fn permits(&self, uid: u32, gid: u32, access: Access) -> bool {
        if uid == 0 {
            return !access.execute || self.is_dir() || self.mode & 0o111 != 0;
        }
        let shift = if uid == self.uid {
            6
        } else if gid == self.gid {
            3
        } else {
            0
        };
        let bits = (self.mode >> shift) & 0o7;
        (!access.read || bits & 0o4 != 0)
            && (!access.write || bits & 0o2 != 0)
            && (!access.execute || bits & 0o1 != 0)
    }

    pub fn metadata(&self) -> Metadata {
        let nlink = match &self.kind {
            NodeKind::Directory(children) => {
                2 + children.values().filter(|c| c.is_dir()).count() as u32
            }
            _ => 1,
        };
        Metadata {
            ino: self.ino,
            node_type: self.node_type(),
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size(),
            nlink,
            atime: self.accessed,
            mtime: self.modified,
            ctime: self.created,
        }
    }
}

/// Node status, as reported by stat
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub ino: u64,
    pub node_type: NodeType,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
}

impl Metadata {
    /// Full `st_mode`: file-type bits plus permission bits
    pub fn st_mode(&self) -> u32 {
        let kind = match self.node_type {
            NodeType::File => mode::S_IFREG,
            NodeType::Directory => mode::S_IFDIR,
            NodeType::Symlink => mode::S_IFLNK,
            NodeType::Device => mode::S_IFCHR,
            NodeType::Socket => mode::S_IFSOCK,
        };
        kind | self.mode as u32
    }
}

/// Split a path into its meaningful components (drops empty and ".")
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

/// Join a canonical parent directory and an entry name
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Join canonical components into an absolute path
pub fn join_components(parts: &[String]) -> String {
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}
