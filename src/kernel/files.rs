//! Open-file table
//!
//! Every open file description in the system lives here. Per-process fd
//! tables hold `Handle`s into this table; `fork` and `dup` retain a handle
//! instead of copying it, so descriptors that share a handle share the byte
//! cursor (POSIX open file description semantics). An entry is dropped when
//! its last reference is released.

use super::network::SocketId;
use super::process::OpenFlags;
use crate::vfs::DeviceKind;
use slab::Slab;
use std::collections::VecDeque;

/// Handle to an open-file entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub usize);

/// What an open file refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenObject {
    /// Regular file or directory, by canonical path
    File { path: String },
    Device(DeviceKind),
    Socket(SocketId),
}

/// An open file description
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub object: OpenObject,
    pub flags: OpenFlags,
    /// Byte cursor, shared by every fd pointing at this entry
    pub offset: u64,
    refcount: usize,
}

impl OpenFile {
    pub fn path(&self) -> Option<&str> {
        match &self.object {
            OpenObject::File { path } => Some(path),
            _ => None,
        }
    }

    pub fn socket(&self) -> Option<SocketId> {
        match self.object {
            OpenObject::Socket(id) => Some(id),
            _ => None,
        }
    }
}

/// Global open-file table
#[derive(Debug, Default)]
pub struct OpenFileTable {
    entries: Slab<OpenFile>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry (refcount starts at 1)
    pub fn open(&mut self, object: OpenObject, flags: OpenFlags) -> Handle {
        Handle(self.entries.insert(OpenFile {
            object,
            flags,
            offset: 0,
            refcount: 1,
        }))
    }

    pub fn get(&self, handle: Handle) -> Option<&OpenFile> {
        self.entries.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut OpenFile> {
        self.entries.get_mut(handle.0)
    }

    /// Increment the reference count
    /// Returns false if the handle doesn't exist
    pub fn retain(&mut self, handle: Handle) -> bool {
        match self.entries.get_mut(handle.0) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the reference count
    /// Returns the entry if this was the last reference
    pub fn release(&mut self, handle: Handle) -> Option<OpenFile> {
        let entry = self.entries.get_mut(handle.0)?;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            Some(self.entries.remove(handle.0))
        } else {
            None
        }
    }

    pub fn refcount(&self, handle: Handle) -> usize {
        self.entries.get(handle.0).map_or(0, |e| e.refcount)
    }

    /// Whether any open description refers to `path`
    pub fn is_open(&self, path: &str) -> bool {
        self.entries.iter().any(|(_, e)| e.path() == Some(path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ========== Device state ==========

/// Undrained stdout/stderr kept per stream; older bytes are dropped first
pub const OUTPUT_BUFFER_SIZE: usize = 1 << 20;

/// Host-visible state of the character devices
#[derive(Debug)]
pub struct Devices {
    /// Bytes queued by the host for /dev/stdin
    stdin: VecDeque<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// xorshift64 state for /dev/random and /dev/urandom
    rng: u64,
}

impl Devices {
    pub fn new(seed: u64) -> Self {
        Self {
            stdin: VecDeque::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            // Ensure non-zero state
            rng: if seed == 0 { 0xDEAD_BEEF_CAFE_BABE } else { seed },
        }
    }

    /// Read from a device; returns bytes produced
    pub fn read(&mut self, device: DeviceKind, buf: &mut [u8]) -> usize {
        match device {
            DeviceKind::Null | DeviceKind::Stdout | DeviceKind::Stderr => 0,
            DeviceKind::Zero => {
                buf.fill(0);
                buf.len()
            }
            DeviceKind::Random | DeviceKind::Urandom => {
                self.fill_random(buf);
                buf.len()
            }
            DeviceKind::Stdin => {
                let n = buf.len().min(self.stdin.len());
                for (dst, src) in buf.iter_mut().zip(self.stdin.drain(..n)) {
                    *dst = src;
                }
                n
            }
        }
    }

    /// Write to a device; returns bytes consumed
    pub fn write(&mut self, device: DeviceKind, data: &[u8]) -> usize {
        match device {
            DeviceKind::Stdout => append_capped(&mut self.stdout, data),
            DeviceKind::Stderr => append_capped(&mut self.stderr, data),
            // Everything else discards
            _ => {}
        }
        data.len()
    }

    fn fill_random(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            // xorshift64
            self.rng ^= self.rng << 13;
            self.rng ^= self.rng >> 7;
            self.rng ^= self.rng << 17;
            let bytes = self.rng.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Queue input for /dev/stdin
    pub fn push_stdin(&mut self, data: &[u8]) {
        self.stdin.extend(data);
    }

    pub fn take_stdout(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stdout)
    }

    pub fn take_stderr(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stderr)
    }
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(data);
    if buf.len() > OUTPUT_BUFFER_SIZE {
        let excess = buf.len() - OUTPUT_BUFFER_SIZE;
        buf.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undrained_stdout_keeps_latest_bytes() {
        let mut devices = Devices::new(1);
        let chunk = vec![b'a'; OUTPUT_BUFFER_SIZE];
        assert_eq!(devices.write(DeviceKind::Stdout, &chunk), OUTPUT_BUFFER_SIZE);
        assert_eq!(devices.write(DeviceKind::Stdout, b"tail"), 4);

        let out = devices.take_stdout();
        assert_eq!(out.len(), OUTPUT_BUFFER_SIZE);
        assert!(out.ends_with(b"aatail"));
        assert!(devices.take_stdout().is_empty());
    }

    fn file(path: &str) -> OpenObject {
        OpenObject::File {
            path: path.to_string(),
        }
    }

    #[test]
    fn test_refcount_lifecycle() {
        let mut table = OpenFileTable::new();
        let h = table.open(file("/tmp/a"), OpenFlags::READ);
        assert_eq!(table.refcount(h), 1);

        assert!(table.retain(h));
        assert_eq!(table.refcount(h), 2);

        assert!(table.release(h).is_none());
        assert!(table.is_open("/tmp/a"));

        let last = table.release(h).expect("last release returns the entry");
        assert_eq!(last.path(), Some("/tmp/a"));
        assert!(!table.is_open("/tmp/a"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_unknown_handle() {
        let mut table = OpenFileTable::new();
        assert!(table.release(Handle(42)).is_none());
        assert!(!table.retain(Handle(42)));
    }

    #[test]
    fn test_shared_cursor() {
        let mut table = OpenFileTable::new();
        let h = table.open(file("/f"), OpenFlags::RDWR);
        table.retain(h);
        table.get_mut(h).unwrap().offset = 10;
        assert_eq!(table.get(h).unwrap().offset, 10);
    }

    #[test]
    fn test_devices() {
        let mut dev = Devices::new(7);
        let mut buf = [1u8; 4];
        assert_eq!(dev.read(DeviceKind::Null, &mut buf), 0);
        assert_eq!(dev.read(DeviceKind::Zero, &mut buf), 4);
        assert_eq!(buf, [0; 4]);

        let mut random = [0u8; 13];
        assert_eq!(dev.read(DeviceKind::Urandom, &mut random), 13);
        assert!(random.iter().any(|&b| b != 0));

        dev.push_stdin(b"hi");
        assert_eq!(dev.read(DeviceKind::Stdin, &mut buf), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(dev.read(DeviceKind::Stdin, &mut buf), 0);

        assert_eq!(dev.write(DeviceKind::Stdout, b"out"), 3);
        assert_eq!(dev.write(DeviceKind::Null, b"gone"), 4);
        assert_eq!(dev.take_stdout(), b"out");
        assert!(dev.take_stdout().is_empty());
    }
}
