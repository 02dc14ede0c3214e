//! Time sources
//!
//! All kernel time is monotonic milliseconds as `f64`, like the rest of the
//! kernel. `ManualClock` is advanced explicitly by `Emulator::tick`, which is
//! what makes scheduling, cache TTLs and timestamps deterministic in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic millisecond clock
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// A clock that only moves when told to
///
/// Cloning shares the underlying time, so the emulator, kernel and
/// dispatcher all observe the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now_ms: f64) -> Self {
        let clock = Self::new();
        clock.set(now_ms);
        clock
    }

    pub fn set(&self, now_ms: f64) {
        self.bits.store(now_ms.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, elapsed_ms: f64) {
        let now = self.now_ms();
        self.set(now + elapsed_ms.max(0.0));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Wall-clock time source for the host
#[derive(Debug, Clone)]
pub struct SystemClock {
    #[cfg(not(target_arch = "wasm32"))]
    start: std::time::Instant,
    #[cfg(target_arch = "wasm32")]
    start: f64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_arch = "wasm32"))]
            start: std::time::Instant::now(),
            #[cfg(target_arch = "wasm32")]
            start: js_sys::Date::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[cfg(not(target_arch = "wasm32"))]
    fn now_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    #[cfg(target_arch = "wasm32")]
    fn now_ms(&self) -> f64 {
        js_sys::Date::now() - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(12.5);
        assert_eq!(other.now_ms(), 12.5);
    }

    #[test]
    fn test_manual_clock_ignores_negative() {
        let clock = ManualClock::starting_at(10.0);
        clock.advance(-5.0);
        assert_eq!(clock.now_ms(), 10.0);
    }
}
