//! Result cache for idempotent syscalls
//!
//! Only an explicit allow-list is cached. An entry remembers the return
//! value and the bytes the call copied into guest memory, so a hit can be
//! replayed exactly. Entries expire by TTL; mutating calls invalidate
//! whatever they may have changed.

use crate::config::DispatcherConfig;
use crate::kernel::{GuestWrite, Pid, SyscallArgs, SyscallNr, SyscallReturn};
use std::collections::HashMap;

/// Which TTL bucket a syscall falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// stat, lstat, fstat
    FileStat,
    /// time, gettimeofday
    Time,
    /// getpid, getppid
    Identity,
}

impl CacheClass {
    pub fn of(nr: u32) -> Option<Self> {
        match SyscallNr::from_num(nr)? {
            SyscallNr::Stat | SyscallNr::Lstat | SyscallNr::Fstat => Some(CacheClass::FileStat),
            SyscallNr::Time | SyscallNr::Gettimeofday => Some(CacheClass::Time),
            SyscallNr::Getpid | SyscallNr::Getppid => Some(CacheClass::Identity),
            _ => None,
        }
    }
}

/// Syscalls that may change what a cached stat reports, including
/// which file an fstat descriptor names
pub fn invalidates_file_stats(nr: u32) -> bool {
    matches!(
        SyscallNr::from_num(nr),
        Some(
            SyscallNr::Write
                | SyscallNr::Open
                | SyscallNr::Close
                | SyscallNr::Dup
                | SyscallNr::Mkdir
                | SyscallNr::Rmdir
                | SyscallNr::Unlink
                | SyscallNr::Symlink
                | SyscallNr::Chdir
        )
    )
}

/// Syscalls that may change parentage
pub fn invalidates_identity(nr: u32) -> bool {
    matches!(
        SyscallNr::from_num(nr),
        Some(
            SyscallNr::Exit
                | SyscallNr::ExitGroup
                | SyscallNr::Wait4
                | SyscallNr::Kill
                | SyscallNr::Execve
                | SyscallNr::Fork
                | SyscallNr::Clone
        )
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub pid: Pid,
    pub nr: u32,
    pub args: SyscallArgs,
    /// Bytes behind pointer arguments (e.g. the path of a stat)
    pub extra: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: SyscallReturn,
    pub writes: Vec<GuestWrite>,
    pub expires_at: f64,
}

#[derive(Debug)]
pub struct SyscallCache {
    entries: HashMap<CacheKey, CacheEntry>,
    capacity: usize,
    default_ttl_ms: f64,
    stat_ttl_ms: f64,
    time_ttl_ms: f64,
}

impl SyscallCache {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: config.cache_capacity,
            default_ttl_ms: config.cache_default_ttl_ms,
            stat_ttl_ms: config.cache_stat_ttl_ms,
            time_ttl_ms: config.cache_time_ttl_ms,
        }
    }

    /// TTL for a syscall, or None if it is never cached
    pub fn ttl_for(&self, nr: u32) -> Option<f64> {
        CacheClass::of(nr).map(|class| match class {
            CacheClass::FileStat => self.stat_ttl_ms,
            CacheClass::Time => self.time_ttl_ms,
            CacheClass::Identity => self.default_ttl_ms,
        })
    }

    /// Look up a live entry; an expired one is dropped
    pub fn get(&mut self, key: &CacheKey, now: f64) -> Option<&CacheEntry> {
        let expired = self.entries.get(key)?.expires_at <= now;
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: CacheKey, result: SyscallReturn, writes: Vec<GuestWrite>, now: f64) {
        let Some(ttl) = self.ttl_for(key.nr) else {
            return;
        };
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.purge_expired(now);
            if self.entries.len() >= self.capacity {
                self.evict_soonest();
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                result,
                writes,
                expires_at: now + ttl,
            },
        );
    }

    fn evict_soonest(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by(|a, b| a.1.expires_at.total_cmp(&b.1.expires_at))
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }

    pub fn purge_expired(&mut self, now: f64) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Drop every entry of a class
    pub fn invalidate_class(&mut self, class: CacheClass) {
        self.entries.retain(|key, _| CacheClass::of(key.nr) != Some(class));
    }

    /// Drop every entry made by `pid`
    pub fn invalidate_pid(&mut self, pid: Pid) {
        self.entries.retain(|key, _| key.pid != pid);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pid: u32, nr: SyscallNr, arg: u64) -> CacheKey {
        CacheKey {
            pid: Pid(pid),
            nr: nr.num(),
            args: SyscallArgs::new(&[arg]),
            extra: None,
        }
    }

    fn cache() -> SyscallCache {
        SyscallCache::new(&DispatcherConfig::default())
    }

    #[test]
    fn test_allow_list() {
        let c = cache();
        assert_eq!(c.ttl_for(SyscallNr::Stat.num()), Some(5_000.0));
        assert_eq!(c.ttl_for(SyscallNr::Time.num()), Some(1_000.0));
        assert_eq!(c.ttl_for(SyscallNr::Getpid.num()), Some(2_000.0));
        assert_eq!(c.ttl_for(SyscallNr::Read.num()), None);
        assert_eq!(c.ttl_for(SyscallNr::ClockGettime.num()), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut c = cache();
        let k = key(1, SyscallNr::Time, 0);
        c.insert(k.clone(), SyscallReturn::ok(42), Vec::new(), 0.0);
        assert_eq!(c.get(&k, 999.0).unwrap().result.value, 42);
        assert!(c.get(&k, 1_000.0).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn test_uncacheable_is_ignored() {
        let mut c = cache();
        c.insert(key(1, SyscallNr::Write, 1), SyscallReturn::ok(1), Vec::new(), 0.0);
        assert!(c.is_empty());
    }

    #[test]
    fn test_invalidation() {
        let mut c = cache();
        c.insert(key(1, SyscallNr::Stat, 0x10), SyscallReturn::ok(0), Vec::new(), 0.0);
        c.insert(key(1, SyscallNr::Getppid, 0), SyscallReturn::ok(0), Vec::new(), 0.0);
        c.insert(key(2, SyscallNr::Getpid, 0), SyscallReturn::ok(2), Vec::new(), 0.0);

        c.invalidate_class(CacheClass::FileStat);
        assert_eq!(c.len(), 2);
        c.invalidate_pid(Pid(2));
        assert_eq!(c.len(), 1);

        assert!(invalidates_file_stats(SyscallNr::Unlink.num()));
        assert!(!invalidates_file_stats(SyscallNr::Read.num()));
        assert!(invalidates_identity(SyscallNr::Exit.num()));
    }

    #[test]
    fn test_capacity_evicts_soonest_expiry() {
        let config = DispatcherConfig {
            cache_capacity: 2,
            ..DispatcherConfig::default()
        };
        let mut c = SyscallCache::new(&config);
        c.insert(key(1, SyscallNr::Time, 0), SyscallReturn::ok(1), Vec::new(), 0.0);
        c.insert(key(1, SyscallNr::Stat, 0), SyscallReturn::ok(0), Vec::new(), 0.0);
        c.insert(key(1, SyscallNr::Getpid, 0), SyscallReturn::ok(1), Vec::new(), 0.0);

        assert_eq!(c.len(), 2);
        assert!(c.get(&key(1, SyscallNr::Time, 0), 0.0).is_none());
        assert!(c.get(&key(1, SyscallNr::Stat, 0), 0.0).is_some());
    }
}
