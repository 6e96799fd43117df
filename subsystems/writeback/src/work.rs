//! Writeback work items and their submission.
//!
//! Producers describe what to flush with a [`WritebackWork`] and hand it to
//! [`enqueue`]. The item lands on the context's pending-work queue and the
//! context is scheduled on the embedder's [`WorkScheduler`]; the
//! [`Executor`] picks it up from there.
//!
//! [`WorkScheduler`]: crate::executor::WorkScheduler
//! [`Executor`]: crate::executor::Executor

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::Ordering;

use crate::completion::Completion;
use crate::context::{ContextFlags, ContextRef};
use crate::device::Device;
use crate::error::WbResult;
use crate::time::MSEC_PER_SEC;

/// Why writeback was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WritebackReason {
    Background   = 0,
    Vmscan       = 1,
    Sync         = 2,
    Periodic     = 3,
    LaptopTimer  = 4,
    FsFreeSpace  = 5,
    ForkerThread = 6,
    ForeignFlush = 7,
}

impl WritebackReason {
    /// Number of reasons
    pub const COUNT: usize = 8;

    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            1 => WritebackReason::Vmscan,
            2 => WritebackReason::Sync,
            3 => WritebackReason::Periodic,
            4 => WritebackReason::LaptopTimer,
            5 => WritebackReason::FsFreeSpace,
            6 => WritebackReason::ForkerThread,
            7 => WritebackReason::ForeignFlush,
            _ => WritebackReason::Background,
        }
    }

    /// Whether the request should run without delay
    pub const fn is_urgent(self) -> bool {
        matches!(
            self,
            WritebackReason::Sync
                | WritebackReason::Vmscan
                | WritebackReason::FsFreeSpace
                | WritebackReason::LaptopTimer
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            WritebackReason::Background => "background",
            WritebackReason::Vmscan => "vmscan",
            WritebackReason::Sync => "sync",
            WritebackReason::Periodic => "periodic",
            WritebackReason::LaptopTimer => "laptop_timer",
            WritebackReason::FsFreeSpace => "fs_free_space",
            WritebackReason::ForkerThread => "forker_thread",
            WritebackReason::ForeignFlush => "foreign_flush",
        }
    }
}

impl fmt::Display for WritebackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Data integrity mode of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Best effort, skip what cannot be written now
    None,
    /// Write everything, timestamps included
    All,
}

/// One flush request
#[derive(Debug, Clone)]
pub struct WritebackWork {
    /// Page budget; zero writes everything eligible
    pub nr_pages: u64,
    pub reason: WritebackReason,
    pub sync_mode: SyncMode,
    /// Stop once the context is below its background threshold
    pub for_background: bool,
    /// Only write data older than the expire interval
    pub for_kupdate: bool,
    pub(crate) done: Option<Arc<Completion>>,
}

impl WritebackWork {
    /// Flush up to `nr_pages` pages
    pub fn new(nr_pages: u64, reason: WritebackReason) -> Self {
        Self {
            nr_pages,
            reason,
            sync_mode: SyncMode::None,
            for_background: false,
            for_kupdate: false,
            done: None,
        }
    }

    /// Flush everything, timestamps included
    pub fn sync() -> Self {
        Self::new(0, WritebackReason::Sync).with_sync_mode(SyncMode::All)
    }

    /// Flush until the context drops below its background threshold
    pub fn background() -> Self {
        let mut work = Self::new(0, WritebackReason::Background);
        work.for_background = true;
        work
    }

    /// Flush expired data
    pub fn periodic() -> Self {
        let mut work = Self::new(0, WritebackReason::Periodic);
        work.for_kupdate = true;
        work
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Signal `done` when the item finishes
    pub fn with_completion(mut self, done: Arc<Completion>) -> Self {
        self.done = Some(done);
        self
    }

    pub fn completion(&self) -> Option<&Arc<Completion>> {
        self.done.as_ref()
    }

    /// Signal the item's completion, if any
    pub(crate) fn finish(self) {
        if let Some(done) = self.done {
            done.done();
        }
    }
}

/// Delay before a context with `work` pending should run
fn schedule_delay(ctx: &ContextRef, device: &Device, work: &WritebackWork) -> u64 {
    if work.nr_pages == 0 || work.reason.is_urgent() {
        return 0;
    }
    let ratelimit = ctx.dirty_ratelimit().max(1);
    (work.nr_pages.saturating_mul(MSEC_PER_SEC) / ratelimit)
        .min(device.shared.config.writeback_interval_ms)
}

/// Schedule `ctx` to run within `delay_ms`.
///
/// A pending run due no later is left alone; an earlier deadline schedules
/// another run, and the later one finds the context drained or busy.
pub(crate) fn wakeup(ctx: &ContextRef, device: &Device, delay_ms: u64) {
    let due = device.shared.clock.now_ms().saturating_add(delay_ms);
    let pending = ctx.scheduled_due_ms.fetch_min(due, Ordering::AcqRel);
    if due < pending {
        device.shared.scheduler.schedule(ctx.clone(), delay_ms);
    }
}

/// Queue `work` on `ctx` and schedule its executor.
///
/// The completion, if any, is charged before the item becomes visible. An
/// unregistered context completes the item on the spot.
pub fn enqueue(ctx: &ContextRef, work: WritebackWork) -> WbResult<()> {
    let device = ctx.device()?;
    if let Some(done) = &work.done {
        done.get();
    }
    ctx.count_reason(work.reason);
    let delay = schedule_delay(ctx, &device, &work);

    let rejected = {
        let mut queue = ctx.work.lock();
        if ctx.is_registered() {
            queue.push_back(work);
            None
        } else {
            Some(work)
        }
    };
    if let Some(work) = rejected {
        log::trace!(
            "writeback: context {} not registered, completing {} work",
            ctx.id(),
            work.reason
        );
        work.finish();
        return Ok(());
    }

    wakeup(ctx, &device, delay);
    Ok(())
}

/// Request a flush of everything on `ctx`.
///
/// Requests are coalesced while one is pending. Returns whether this call
/// raised the request.
pub fn start_all(ctx: &ContextRef, reason: WritebackReason) -> WbResult<bool> {
    let device = ctx.device()?;
    if !ctx.is_registered() || !ctx.has_dirty_io() {
        return Ok(false);
    }
    if ctx.test_and_set(ContextFlags::START_ALL) {
        return Ok(false);
    }
    ctx.set_start_all_reason(reason);
    ctx.count_reason(reason);
    wakeup(ctx, &device, 0);
    Ok(true)
}
