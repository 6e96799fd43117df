//! # Distributed Counters
//!
//! Sharded statistics counters. Increments land on a shard picked by the
//! caller's shard hint and only fold into the central total once the shard
//! drifts by a full batch, so hot paths on different CPUs rarely share a
//! cache line.
//!
//! Reads come in two flavours:
//!
//! - [`ShardedCounter::read`] returns the central total without locking. It
//!   may lag the true value by up to `shards * batch`.
//! - [`ShardedCounter::sum`] takes the fold lock and adds every shard.
//!
//! [`ShardedCounter::consolidate`] folds all shards under the lock. The
//! engine calls it from its periodic tick, so lock-free reads are eventually
//! consistent within one tick.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI64, Ordering};

use spin::{Mutex, Once};

/// Function returning the caller's shard hint (usually the CPU number)
pub type ShardHint = fn() -> usize;

static SHARD_HINT: Once<ShardHint> = Once::new();

/// Install the per-CPU shard hint. Only the first call takes effect.
pub fn set_shard_hint(hint: ShardHint) -> bool {
    let mut installed = false;
    SHARD_HINT.call_once(|| {
        installed = true;
        hint
    });
    installed
}

#[inline]
fn current_shard() -> usize {
    match SHARD_HINT.get() {
        Some(hint) => hint(),
        None => {
            // Stack pages differ per thread of control.
            let marker = 0u8;
            (&marker as *const u8 as usize) >> 12
        }
    }
}

#[derive(Default)]
#[repr(align(64))]
struct Shard {
    value: AtomicI64,
}

/// Sharded counter with batched folding
pub struct ShardedCounter {
    central: Mutex<i64>,
    approx: AtomicI64,
    shards: Box<[Shard]>,
    batch: i64,
}

impl ShardedCounter {
    /// Create a counter with `shards` shards folding every `batch` units
    pub fn new(shards: usize, batch: i64) -> Self {
        let shards: Vec<Shard> = (0..shards.max(1)).map(|_| Shard::default()).collect();
        Self {
            central: Mutex::new(0),
            approx: AtomicI64::new(0),
            shards: shards.into_boxed_slice(),
            batch: batch.max(1),
        }
    }

    /// Add `delta`, folding the shard once it drifts a full batch
    #[inline]
    pub fn add(&self, delta: i64) {
        let shard = &self.shards[current_shard() % self.shards.len()];
        let local = shard.value.fetch_add(delta, Ordering::Relaxed) + delta;
        if local >= self.batch || local <= -self.batch {
            let mut central = self.central.lock();
            *central += shard.value.swap(0, Ordering::AcqRel);
            self.approx.store(*central, Ordering::Release);
        }
    }

    /// Add one
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    /// Subtract one
    #[inline]
    pub fn dec(&self) {
        self.add(-1);
    }

    /// Approximate value without locking
    #[inline]
    pub fn read(&self) -> i64 {
        self.approx.load(Ordering::Acquire)
    }

    /// Approximate value clamped at zero
    #[inline]
    pub fn read_positive(&self) -> u64 {
        self.read().max(0) as u64
    }

    /// Accurate value, folding nothing
    pub fn sum(&self) -> i64 {
        let central = self.central.lock();
        *central
            + self
                .shards
                .iter()
                .map(|s| s.value.load(Ordering::Acquire))
                .sum::<i64>()
    }

    /// Accurate value clamped at zero
    pub fn sum_positive(&self) -> u64 {
        self.sum().max(0) as u64
    }

    /// Fold every shard into the central total and return it
    pub fn consolidate(&self) -> i64 {
        let mut central = self.central.lock();
        for shard in self.shards.iter() {
            *central += shard.value.swap(0, Ordering::AcqRel);
        }
        self.approx.store(*central, Ordering::Release);
        *central
    }

    /// Overwrite the value
    pub fn set(&self, value: i64) {
        let mut central = self.central.lock();
        for shard in self.shards.iter() {
            shard.value.store(0, Ordering::Release);
        }
        *central = value;
        self.approx.store(value, Ordering::Release);
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl fmt::Debug for ShardedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedCounter")
            .field("approx", &self.read())
            .field("shards", &self.shards.len())
            .field("batch", &self.batch)
            .finish()
    }
}
