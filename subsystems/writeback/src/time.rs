//! Time source for the writeback engine.
//!
//! The engine never reads a hardware timer itself; the embedder provides a
//! monotonic millisecond clock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds per second
pub const MSEC_PER_SEC: u64 = 1000;

/// Monotonic millisecond clock
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u64;
}

/// Clock advanced by hand, for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `start_ms`
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::Release);
    }

    /// Advance and return the new time
    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now.fetch_add(delta_ms, Ordering::AcqRel) + delta_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Time elapsed since `then`, zero if the clock appears to go backwards
#[inline]
pub(crate) fn elapsed_ms(now: u64, then: u64) -> u64 {
    now.saturating_sub(then)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.now_ms(), 10);
        assert_eq!(clock.advance(5), 15);
        clock.set(100);
        assert_eq!(clock.now_ms(), 100);
        assert_eq!(elapsed_ms(90, 100), 0);
    }
}
