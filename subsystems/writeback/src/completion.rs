//! # Completion Primitive
//!
//! A [`Completion`] lets an issuer block until a batch of queued writeback
//! items has finished. It starts with a count of one, the issuer's own unit.
//! Every item queued with the completion adds one when it becomes visible to
//! the executor and subtracts one when it finishes. [`Completion::wait`]
//! drops the issuer's unit and blocks until the count reaches zero; the
//! transition to zero wakes the device wait queue exactly once.
//!
//! ```text
//!   issuer            queue            executor
//!     │  new() ── cnt=1  │                │
//!     │── enqueue ──▶ cnt=2 ─────────────▶│ done() cnt=1
//!     │── enqueue ──▶ cnt=3 ─────────────▶│ done() cnt=0 ──▶ wake_all
//!     │  wait(): done() ... blocks until cnt == 0
//! ```
//!
//! Completions are owned by their issuers. The engine only holds shared
//! handles while items are in flight; there is no timeout and no
//! cancellation.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::error::{report_fault, WbError, WbResult};

// =============================================================================
// WAIT QUEUE
// =============================================================================

/// Relax hook run between polls of a blocked waiter
pub type RelaxFn = fn();

fn spin_relax() {
    core::hint::spin_loop();
}

/// Device wait channel
pub struct WaitQueue {
    generation: AtomicU64,
    waiters: AtomicUsize,
    relax: RelaxFn,
}

impl WaitQueue {
    /// Create a queue whose waiters busy-poll
    pub const fn new() -> Self {
        Self::with_relax(spin_relax)
    }

    /// Create a queue whose waiters call `relax` between polls
    pub const fn with_relax(relax: RelaxFn) -> Self {
        Self {
            generation: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
            relax,
        }
    }

    /// Wake every waiter
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Block until `cond` holds
    pub fn wait_event<F: Fn() -> bool>(&self, cond: F) {
        if cond() {
            return;
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        loop {
            let seen = self.generation.load(Ordering::Acquire);
            if cond() {
                break;
            }
            while self.generation.load(Ordering::Acquire) == seen && !cond() {
                (self.relax)();
            }
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of wake-ups issued so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of blocked waiters
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("generation", &self.generation())
            .field("waiters", &self.waiters())
            .finish()
    }
}

// =============================================================================
// COMPLETION
// =============================================================================

/// Shared count + wait channel for a batch of writeback items
pub struct Completion {
    count: AtomicUsize,
    waitq: Arc<WaitQueue>,
    releases: AtomicU32,
}

impl Completion {
    /// Create a completion signalling through `waitq`
    pub fn new(waitq: Arc<WaitQueue>) -> Self {
        Self {
            count: AtomicUsize::new(1),
            waitq,
            releases: AtomicU32::new(0),
        }
    }

    /// Account one more queued item
    pub(crate) fn get(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Account one finished unit. Returns `true` when this was the last one.
    pub(crate) fn done(&self) -> bool {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match prev {
            Ok(1) => {
                self.releases.fetch_add(1, Ordering::AcqRel);
                self.waitq.wake_all();
                true
            },
            Ok(_) => false,
            Err(_) => {
                report_fault(WbError::RefcountUnderflow, "completion::done");
                false
            },
        }
    }

    /// Drop the issuer's unit and block until every queued item finished
    pub fn wait(&self) {
        self.done();
        self.waitq
            .wait_event(|| self.count.load(Ordering::Acquire) == 0);
    }

    /// Outstanding units, including the issuer's until it waits
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the count reached zero
    pub fn is_done(&self) -> bool {
        self.pending() == 0
    }

    /// Number of times the count reached zero
    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::Acquire)
    }

    /// Re-arm a drained completion for another batch
    pub fn reset(&self) -> WbResult<()> {
        self.count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| WbError::Busy)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.pending())
            .field("releases", &self.releases())
            .finish()
    }
}

/// Block until `done` drains
pub fn wait_for_completion(done: &Completion) {
    done.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn completion() -> Arc<Completion> {
        Arc::new(Completion::new(Arc::new(WaitQueue::with_relax(
            std::thread::yield_now,
        ))))
    }

    fn run_batch(items: usize) -> (u32, usize) {
        let done = completion();
        for _ in 0..items {
            done.get();
        }
        let workers: Vec<_> = (0..items)
            .map(|_| {
                let done = done.clone();
                std::thread::spawn(move || {
                    done.done();
                })
            })
            .collect();
        wait_for_completion(&done);
        for worker in workers {
            worker.join().unwrap();
        }
        (done.releases(), done.pending())
    }

    #[test]
    fn test_zero_items_releases_on_wait() {
        assert_eq!(run_batch(0), (1, 0));
    }

    #[test]
    fn test_single_item() {
        assert_eq!(run_batch(1), (1, 0));
    }

    #[test]
    fn test_hundred_items_release_once() {
        assert_eq!(run_batch(100), (1, 0));
    }

    #[test]
    fn test_release_requires_issuer_unit() {
        let done = completion();
        done.get();
        assert!(!done.done());
        assert!(!done.is_done());
        assert!(done.done());
        assert!(done.is_done());
    }

    #[test]
    fn test_underflow_is_rejected() {
        let done = completion();
        assert!(done.done());
        assert!(!done.done());
        assert_eq!(done.pending(), 0);
        assert_eq!(done.releases(), 1);
    }

    #[test]
    fn test_reset_only_after_drain() {
        let done = completion();
        assert_eq!(done.reset(), Err(WbError::Busy));
        done.wait();
        assert!(done.reset().is_ok());
        assert_eq!(done.pending(), 1);
    }
}
