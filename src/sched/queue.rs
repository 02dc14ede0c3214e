//! Per-tier run queue

use crate::kernel::Pid;
use std::collections::VecDeque;

/// Runnable processes of one priority tier, in arrival order
///
/// A process stays queued while it runs; leaving the queue means it is
/// no longer runnable.
#[derive(Debug, Clone, Default)]
pub struct RunQueue {
    pids: VecDeque<Pid>,
    /// Next round-robin position; wraps lazily so late arrivals are
    /// reached before the head comes round again
    cursor: usize,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append; a pid already queued keeps its place
    pub fn push(&mut self, pid: Pid) -> bool {
        if self.contains(pid) {
            return false;
        }
        self.pids.push_back(pid);
        true
    }

    pub fn remove(&mut self, pid: Pid) -> bool {
        let Some(index) = self.pids.iter().position(|p| *p == pid) else {
            return false;
        };
        self.pids.remove(index);
        // Keep the cursor pointing at the same successor
        if index < self.cursor {
            self.cursor -= 1;
        }
        true
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.pids.contains(&pid)
    }

    pub fn head(&self) -> Option<Pid> {
        self.pids.front().copied()
    }

    /// Take the head and requeue it at the tail
    pub fn cycle(&mut self) -> Option<Pid> {
        let pid = self.pids.pop_front()?;
        self.pids.push_back(pid);
        Some(pid)
    }

    /// The pid under the cursor; advances the cursor
    pub fn rotate(&mut self) -> Option<Pid> {
        if self.pids.is_empty() {
            return None;
        }
        if self.cursor >= self.pids.len() {
            self.cursor = 0;
        }
        let pid = self.pids[self.cursor];
        self.cursor += 1;
        Some(pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_visits_each_once() {
        let mut q = RunQueue::new();
        for i in 1..=3 {
            q.push(Pid(i));
        }
        let seen: Vec<Pid> = (0..3).filter_map(|_| q.rotate()).collect();
        assert_eq!(seen, vec![Pid(1), Pid(2), Pid(3)]);
        assert_eq!(q.rotate(), Some(Pid(1)));
    }

    #[test]
    fn test_remove_keeps_cursor() {
        let mut q = RunQueue::new();
        for i in 1..=3 {
            q.push(Pid(i));
        }
        q.rotate();
        q.rotate();
        // cursor now at pid 3
        q.remove(Pid(1));
        assert_eq!(q.rotate(), Some(Pid(3)));
        assert_eq!(q.rotate(), Some(Pid(2)));
    }

    #[test]
    fn test_push_dedups_and_cycle() {
        let mut q = RunQueue::new();
        assert!(q.push(Pid(1)));
        assert!(!q.push(Pid(1)));
        q.push(Pid(2));
        assert_eq!(q.cycle(), Some(Pid(1)));
        assert_eq!(q.head(), Some(Pid(2)));
        assert!(q.remove(Pid(2)));
        assert!(!q.remove(Pid(2)));
        assert_eq!(q.len(), 1);
    }
}
