//! Audit ring buffer of dispatched syscalls

use super::SyscallContext;
use crate::kernel::Pid;
use std::collections::VecDeque;

/// Default number of records kept
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Bounded log; the oldest record is dropped when full
#[derive(Debug)]
pub struct AuditLog {
    records: VecDeque<SyscallContext>,
    capacity: usize,
    /// Records dropped because the buffer was full
    dropped: u64,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, record: SyscallContext) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(record);
    }

    /// Oldest first
    pub fn records(&self) -> impl Iterator<Item = &SyscallContext> {
        self.records.iter()
    }

    /// The last `n` records, oldest first
    pub fn recent(&self, n: usize) -> Vec<&SyscallContext> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).collect()
    }

    pub fn for_pid(&self, pid: Pid) -> Vec<&SyscallContext> {
        self.records.iter().filter(|r| r.pid == pid).collect()
    }

    pub fn blocked(&self) -> Vec<&SyscallContext> {
        self.records.iter().filter(|r| r.blocked).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Serialize the buffer as a JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        let records: Vec<&SyscallContext> = self.records.iter().collect();
        serde_json::to_string(&records)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SyscallArgs;

    fn record(pid: u32, nr: u32) -> SyscallContext {
        SyscallContext::new(Pid(pid), nr, SyscallArgs::default(), 0.0)
    }

    #[test]
    fn test_ring_drops_oldest() {
        let mut log = AuditLog::new(3);
        for nr in 0..5 {
            log.push(record(1, nr));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.dropped(), 2);
        let nrs: Vec<u32> = log.records().map(|r| r.nr).collect();
        assert_eq!(nrs, vec![2, 3, 4]);
        assert_eq!(log.recent(2).len(), 2);
        assert_eq!(log.recent(2)[0].nr, 3);
    }

    #[test]
    fn test_filters() {
        let mut log = AuditLog::default();
        log.push(record(1, 0));
        let mut blocked = record(2, 62);
        blocked.blocked = true;
        log.push(blocked);

        assert_eq!(log.for_pid(Pid(2)).len(), 1);
        assert_eq!(log.blocked().len(), 1);
        assert_eq!(log.capacity(), DEFAULT_AUDIT_CAPACITY);
        assert!(log.to_json().unwrap().contains("\"nr\":62"));
    }
}
