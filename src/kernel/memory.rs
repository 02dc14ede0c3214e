//! Memory Management
//!
//! A synthetic per-process address space backing `brk`, `mmap`, `munmap`
//! and `mprotect`. There is no MMU in WASM, so nothing here stores bytes:
//! the address space tracks which page-aligned ranges are mapped, with what
//! protection, and enforces the per-process memory limit. Guest data lives
//! in the process's linear memory (see `wasm.rs`).
//!
//! Layout:
//! - heap: grows up from `HEAP_BASE` via `brk`
//! - mappings: first-fit between `MMAP_BASE` and `MMAP_END`
//! - main thread stack: just below `STACK_TOP`

use super::abi::mman;
use super::errno::Errno;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Page size for all mappings
pub const PAGE_SIZE: u64 = 4096;

/// Start of the program break
pub const HEAP_BASE: u64 = 0x0040_0000;

/// Lowest address handed out by non-fixed mmap
pub const MMAP_BASE: u64 = 0x4000_0000;

/// End (exclusive) of the mmap area
pub const MMAP_END: u64 = 0x7f00_0000_0000;

/// Top of the main thread's stack
pub const STACK_TOP: u64 = 0x7fff_0000_0000;

/// Main thread stack size
pub const STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const NONE: Protection = Protection {
        read: false,
        write: false,
        execute: false,
    };

    pub const READ: Protection = Protection {
        read: true,
        write: false,
        execute: false,
    };

    pub const READ_WRITE: Protection = Protection {
        read: true,
        write: true,
        execute: false,
    };

    /// Decode `PROT_*` bits
    pub fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & mman::PROT_READ != 0,
            write: bits & mman::PROT_WRITE != 0,
            execute: bits & mman::PROT_EXEC != 0,
        }
    }
}

impl Default for Protection {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

/// Memory errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),

    #[error("invalid length")]
    InvalidLength,

    #[error("range is not mapped")]
    NotMapped,

    #[error("access outside linear memory at {addr:#x} (+{len})")]
    OutOfBounds { addr: u64, len: usize },
}

impl From<MemoryError> for Errno {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory | MemoryError::NotMapped => Errno::ENOMEM,
            MemoryError::Unaligned(_) | MemoryError::InvalidLength => Errno::EINVAL,
            MemoryError::OutOfBounds { .. } => Errno::EFAULT,
        }
    }
}

/// Round up to the next page boundary
pub fn page_align(len: u64) -> Option<u64> {
    len.checked_add(PAGE_SIZE - 1).map(|l| l & !(PAGE_SIZE - 1))
}

fn is_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE == 0
}

/// A mapped range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub len: u64,
    pub protection: Protection,
    pub shared: bool,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Address-space usage summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub heap: u64,
    pub mapped: u64,
    pub limit: u64,
    pub peak: u64,
    pub region_count: usize,
}

/// Per-process address space
///
/// Cloning produces an independent copy, which is what fork wants.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    brk: u64,
    /// Mapped regions keyed by start address; never overlapping
    regions: BTreeMap<u64, MemoryRegion>,
    /// Limit on heap + mapped bytes (0 = unlimited)
    limit: u64,
    peak: u64,
}

impl AddressSpace {
    pub fn new(limit: u64) -> Self {
        Self {
            brk: HEAP_BASE,
            regions: BTreeMap::new(),
            limit,
            peak: 0,
        }
    }

    pub fn stack_top(&self) -> u64 {
        STACK_TOP
    }

    /// Current program break
    pub fn current_brk(&self) -> u64 {
        self.brk
    }

    /// Heap bytes, rounded to pages
    pub fn heap_bytes(&self) -> u64 {
        page_align(self.brk - HEAP_BASE).unwrap_or(u64::MAX)
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.regions.values().map(|r| r.len).sum()
    }

    /// Heap plus mappings, the quantity the limit applies to
    pub fn total_bytes(&self) -> u64 {
        self.heap_bytes() + self.mapped_bytes()
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    /// Region containing `addr`, if any
    pub fn region_at(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| addr < r.end())
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            heap: self.heap_bytes(),
            mapped: self.mapped_bytes(),
            limit: self.limit,
            peak: self.peak,
            region_count: self.regions.len(),
        }
    }

    fn check_limit(&self, total: u64) -> Result<(), MemoryError> {
        if self.limit > 0 && total > self.limit {
            return Err(MemoryError::OutOfMemory);
        }
        Ok(())
    }

    fn note_usage(&mut self) {
        self.peak = self.peak.max(self.total_bytes());
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.regions
            .range(..end)
            .next_back()
            .is_some_and(|(_, r)| r.end() > start)
    }

    // ========== brk ==========

    /// Move the program break. `0` (or anything below the heap base) queries
    /// the current break.
    pub fn brk(&mut self, addr: u64) -> Result<u64, MemoryError> {
        if addr < HEAP_BASE {
            return Ok(self.brk);
        }
        if addr > self.brk {
            let new_heap = page_align(addr - HEAP_BASE).ok_or(MemoryError::OutOfMemory)?;
            let heap_end = HEAP_BASE + new_heap;
            if heap_end > self.brk && self.overlaps(page_align(self.brk).unwrap_or(u64::MAX), heap_end) {
                return Err(MemoryError::OutOfMemory);
            }
            self.check_limit(new_heap + self.mapped_bytes())?;
        }
        self.brk = addr;
        self.note_usage();
        Ok(self.brk)
    }

    // ========== mmap / munmap / mprotect ==========

    /// Map `len` bytes. Without MAP_FIXED the hint is used when it is
    /// aligned and free, otherwise the first free gap is chosen.
    pub fn mmap(&mut self, addr: u64, len: u64, prot: u32, flags: u32) -> Result<u64, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidLength);
        }
        let len = page_align(len).ok_or(MemoryError::InvalidLength)?;
        let shared = flags & mman::MAP_SHARED != 0;
        let protection = Protection::from_bits(prot);

        let start = if flags & mman::MAP_FIXED != 0 {
            if !is_aligned(addr) {
                return Err(MemoryError::Unaligned(addr));
            }
            let end = addr.checked_add(len).ok_or(MemoryError::InvalidLength)?;
            let replaced: u64 = self
                .regions
                .values()
                .filter(|r| r.start < end && r.end() > addr)
                .map(|r| r.end().min(end) - r.start.max(addr))
                .sum();
            self.check_limit(self.total_bytes() - replaced + len)?;
            self.remove_range(addr, end);
            addr
        } else {
            self.check_limit(self.total_bytes() + len)?;
            let hint_free = addr != 0
                && is_aligned(addr)
                && addr >= MMAP_BASE
                && addr.checked_add(len).is_some_and(|end| end <= MMAP_END && !self.overlaps(addr, end));
            if hint_free {
                addr
            } else {
                self.find_free(len)?
            }
        };

        self.regions.insert(
            start,
            MemoryRegion {
                start,
                len,
                protection,
                shared,
            },
        );
        self.note_usage();
        Ok(start)
    }

    /// Unmap a range; parts of regions outside it survive as split regions.
    /// Unmapping an unmapped range is not an error.
    pub fn munmap(&mut self, addr: u64, len: u64) -> Result<(), MemoryError> {
        if !is_aligned(addr) {
            return Err(MemoryError::Unaligned(addr));
        }
        if len == 0 {
            return Err(MemoryError::InvalidLength);
        }
        let len = page_align(len).ok_or(MemoryError::InvalidLength)?;
        let end = addr.checked_add(len).ok_or(MemoryError::InvalidLength)?;
        self.remove_range(addr, end);
        Ok(())
    }

    /// Change protection of a fully mapped range
    pub fn mprotect(&mut self, addr: u64, len: u64, prot: u32) -> Result<(), MemoryError> {
        if !is_aligned(addr) {
            return Err(MemoryError::Unaligned(addr));
        }
        let len = page_align(len).ok_or(MemoryError::InvalidLength)?;
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len).ok_or(MemoryError::InvalidLength)?;
        if !self.is_mapped(addr, end) {
            return Err(MemoryError::NotMapped);
        }
        self.split_at(addr);
        self.split_at(end);
        let protection = Protection::from_bits(prot);
        for (_, region) in self.regions.range_mut(addr..end) {
            region.protection = protection;
        }
        Ok(())
    }

    /// True if every byte of [start, end) is covered by some region
    pub fn is_mapped(&self, start: u64, end: u64) -> bool {
        let Some(first) = self.region_at(start) else {
            return false;
        };
        let mut cursor = first.end();
        for (_, r) in self.regions.range(start + 1..end) {
            if r.start > cursor {
                return false;
            }
            cursor = cursor.max(r.end());
        }
        cursor >= end
    }

    fn find_free(&self, len: u64) -> Result<u64, MemoryError> {
        let mut candidate = MMAP_BASE;
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.start >= candidate + len {
                break;
            }
            candidate = region.end();
        }
        if candidate + len <= MMAP_END {
            Ok(candidate)
        } else {
            Err(MemoryError::OutOfMemory)
        }
    }

    /// Split the region straddling `addr` so that `addr` becomes a boundary
    fn split_at(&mut self, addr: u64) {
        let Some((&start, region)) = self.regions.range(..addr).next_back() else {
            return;
        };
        let end = region.end();
        if addr <= start || addr >= end {
            return;
        }
        let mut tail = region.clone();
        tail.start = addr;
        tail.len = end - addr;
        if let Some(head) = self.regions.get_mut(&start) {
            head.len = addr - start;
        }
        self.regions.insert(addr, tail);
    }

    fn remove_range(&mut self, start: u64, end: u64) {
        self.split_at(start);
        self.split_at(end);
        let doomed: Vec<u64> = self.regions.range(start..end).map(|(&s, _)| s).collect();
        for s in doomed {
            self.regions.remove(&s);
        }
    }
}
