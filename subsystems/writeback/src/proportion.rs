//! # Proportional Share Tracker
//!
//! Each context counts the pages it finished writing in a local accumulator;
//! every increment is mirrored into the device total. History decays: each
//! elapsed period halves the device total, and a local accumulator catches
//! up on the halvings it missed the next time it is touched. A context's
//! share is its accumulator over the device total, so recent behaviour
//! dominates all-time history.
//!
//! The device total is additionally kept below `2^precision_shift`; crossing
//! that bound forces an early period.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::config::WritebackConfig;
use crate::counter::ShardedCounter;
use crate::time::elapsed_ms;

/// Fixed-point shift for share fractions
pub const FPROP_FRAC_SHIFT: u32 = 10;

/// `1.0` in share fixed point
pub const FPROP_FRAC_BASE: u64 = 1 << FPROP_FRAC_SHIFT;

/// Halvings beyond this clear a counter outright
const MAX_DECAY_SHIFT: u32 = 63;

/// A numerator/denominator pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    /// Context completions
    pub numerator: u64,
    /// Device completions
    pub denominator: u64,
}

impl Share {
    /// The whole device
    pub const FULL: Share = Share {
        numerator: 1,
        denominator: 1,
    };

    /// Whether the device has no completion history at all
    pub fn is_empty(&self) -> bool {
        self.denominator == 0
    }

    /// `value * numerator / denominator`, zero for an empty share
    pub fn scale(&self, value: u64) -> u64 {
        if self.denominator == 0 {
            return 0;
        }
        (value as u128 * self.numerator as u128 / self.denominator as u128) as u64
    }

    /// Share expressed in `FPROP_FRAC_BASE` units
    pub fn as_frac(&self) -> u64 {
        self.scale(FPROP_FRAC_BASE)
    }
}

// =============================================================================
// DEVICE TOTAL
// =============================================================================

/// Device-wide decaying completion total
pub struct PropGlobal {
    events: ShardedCounter,
    period: AtomicU32,
    period_start_ms: AtomicU64,
    period_lock: Mutex<()>,
    period_ms: u64,
    cap: u64,
}

impl PropGlobal {
    /// Create a total whose first period starts at `now_ms`
    pub fn new(config: &WritebackConfig, now_ms: u64) -> Self {
        Self {
            events: ShardedCounter::new(config.counter_shards, config.counter_batch),
            period: AtomicU32::new(0),
            period_start_ms: AtomicU64::new(now_ms),
            period_lock: Mutex::new(()),
            period_ms: config.prop_period_ms,
            cap: 1u64 << config.prop_precision_shift,
        }
    }

    /// Current period sequence number
    #[inline]
    pub fn period(&self) -> u32 {
        self.period.load(Ordering::Acquire)
    }

    /// Accurate decayed total
    pub fn events(&self) -> u64 {
        self.events.sum_positive()
    }

    /// Precision bound of the total
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Start as many periods as elapsed since the current one began.
    ///
    /// Returns the number of periods advanced.
    pub fn tick(&self, now_ms: u64) -> u32 {
        let start = self.period_start_ms.load(Ordering::Acquire);
        let elapsed = elapsed_ms(now_ms, start);
        if elapsed < self.period_ms {
            return 0;
        }
        let periods = (elapsed / self.period_ms).min(u32::MAX as u64) as u32;
        let next = start + periods as u64 * self.period_ms;
        if self
            .period_start_ms
            .compare_exchange(start, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another ticker got there first.
            return 0;
        }
        self.new_period(periods);
        periods
    }

    fn new_period(&self, periods: u32) -> bool {
        let _guard = self.period_lock.lock();
        let events = self.events.sum();
        if events <= 1 {
            return false;
        }
        let kept = if periods >= MAX_DECAY_SHIFT {
            0
        } else {
            events >> periods
        };
        self.events.add(kept - events);
        self.period.fetch_add(periods, Ordering::AcqRel);
        true
    }

    fn add(&self, n: u64) {
        self.events.add(n as i64);
        if self.events.read_positive() > self.cap {
            self.new_period(1);
        }
    }
}

impl fmt::Debug for PropGlobal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropGlobal")
            .field("events", &self.events.read())
            .field("period", &self.period())
            .field("period_ms", &self.period_ms)
            .finish()
    }
}

// =============================================================================
// CONTEXT ACCUMULATOR
// =============================================================================

/// Per-context completion accumulator
pub struct PropLocal {
    events: ShardedCounter,
    period: AtomicU32,
    lock: Mutex<()>,
}

impl PropLocal {
    /// Create an accumulator synchronized with `global`
    pub fn new(config: &WritebackConfig, global: &PropGlobal) -> Self {
        Self {
            events: ShardedCounter::new(config.counter_shards, config.counter_batch),
            period: AtomicU32::new(global.period()),
            lock: Mutex::new(()),
        }
    }

    fn reflect_period(&self, global: &PropGlobal) {
        let current = global.period();
        if self.period.load(Ordering::Acquire) == current {
            return;
        }
        let _guard = self.lock.lock();
        let seen = self.period.load(Ordering::Acquire);
        let missed = current.wrapping_sub(seen);
        if missed == 0 || missed > u32::MAX / 2 {
            return;
        }
        if missed < MAX_DECAY_SHIFT {
            let value = self.events.sum();
            self.events.add((value >> missed) - value);
        } else {
            self.events.set(0);
        }
        self.period.store(current, Ordering::Release);
    }

    /// Record `n` completions
    pub fn inc(&self, global: &PropGlobal, n: u64) {
        if n == 0 {
            return;
        }
        self.reflect_period(global);
        self.events.add(n as i64);
        global.add(n);
    }

    /// Record `n` completions unless the share already exceeds `max_frac`.
    ///
    /// Returns whether the completions were counted.
    pub fn inc_max(&self, global: &PropGlobal, n: u64, max_frac: u64) -> bool {
        if max_frac < FPROP_FRAC_BASE {
            let share = self.fraction(global);
            if share.numerator as u128 * FPROP_FRAC_BASE as u128
                > max_frac as u128 * share.denominator as u128
            {
                return false;
            }
        }
        self.inc(global, n);
        true
    }

    /// Current share of the device total
    pub fn fraction(&self, global: &PropGlobal) -> Share {
        self.reflect_period(global);
        let numerator = self.events.sum_positive();
        let denominator = global.events().max(numerator);
        Share {
            numerator,
            denominator,
        }
    }

    /// Accumulated (decayed) completions
    pub fn events(&self) -> u64 {
        self.events.sum_positive()
    }

    /// Fold distributed shards
    pub fn consolidate(&self) {
        self.events.consolidate();
    }

    /// Drop all history
    pub fn reset(&self) {
        self.events.set(0);
    }
}

impl fmt::Debug for PropLocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropLocal")
            .field("events", &self.events.read())
            .field("period", &self.period.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WritebackConfig {
        WritebackConfig::new()
            .with_counters(2, 4)
            .with_proportion(1000, 20)
    }

    #[test]
    fn test_shares_follow_completions() {
        let config = config();
        let global = PropGlobal::new(&config, 0);
        let a = PropLocal::new(&config, &global);
        let b = PropLocal::new(&config, &global);

        a.inc(&global, 300);
        b.inc(&global, 100);

        let share_a = a.fraction(&global);
        assert_eq!(share_a.numerator, 300);
        assert_eq!(share_a.denominator, 400);
        assert_eq!(b.fraction(&global).as_frac(), FPROP_FRAC_BASE / 4);
    }

    #[test]
    fn test_period_halves_history() {
        let config = config();
        let global = PropGlobal::new(&config, 0);
        let a = PropLocal::new(&config, &global);
        a.inc(&global, 800);

        assert_eq!(global.tick(500), 0);
        assert_eq!(global.tick(2100), 2);
        assert_eq!(global.events(), 200);
        assert_eq!(a.fraction(&global).numerator, 200);
    }

    #[test]
    fn test_recent_activity_dominates() {
        let config = config();
        let global = PropGlobal::new(&config, 0);
        let old = PropLocal::new(&config, &global);
        let new = PropLocal::new(&config, &global);

        old.inc(&global, 1000);
        global.tick(4000);
        new.inc(&global, 500);

        assert!(new.fraction(&global).as_frac() > old.fraction(&global).as_frac());
    }

    #[test]
    fn test_max_fraction_stops_accrual() {
        let config = config();
        let global = PropGlobal::new(&config, 0);
        let a = PropLocal::new(&config, &global);
        let b = PropLocal::new(&config, &global);
        b.inc(&global, 100);
        a.inc(&global, 100);

        // a holds 50%, capped at 25%
        assert!(!a.inc_max(&global, 10, FPROP_FRAC_BASE / 4));
        assert_eq!(a.events(), 100);
        assert!(b.inc_max(&global, 10, FPROP_FRAC_BASE));
    }

    #[test]
    fn test_total_is_capped() {
        let config = WritebackConfig::new()
            .with_counters(1, 1)
            .with_proportion(1000, 8);
        let global = PropGlobal::new(&config, 0);
        let a = PropLocal::new(&config, &global);
        for _ in 0..10 {
            a.inc(&global, 200);
        }
        assert!(global.events() <= global.cap() + 200);
        assert!(global.period() > 0);
    }
}
