//! # Work Executor
//!
//! Drains the pending work of one context. The embedder's scheduler calls
//! [`Executor::run`] for every context handed to
//! [`WorkScheduler::schedule`]; runs of the same context are serialized by
//! the context's drain lock, runs of different contexts are independent.
//!
//! ```text
//!   run(ctx)
//!     ├─ take all pending items (work lock)
//!     ├─ per item:
//!     │    queue_io ─▶ pop inode (list lock) ─▶ write_inode (no lock)
//!     │        ─▶ stats, share, requeue (list lock)
//!     │    bandwidth sample, congestion update
//!     │    finish: completion.done()
//!     └─ idle: start-all pass, or periodic flush of expired data
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::context::{ContextFlags, ContextRef, StatItem, NOT_SCHEDULED};
use crate::device::Device;
use crate::error::WbResult;
use crate::queues::{DirtyInode, QueueKind};
use crate::time::Clock;
use crate::work::{self, SyncMode, WritebackReason, WritebackWork};

// =============================================================================
// COLLABORATORS
// =============================================================================

/// State of an inode after a write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Nothing dirty is left
    Clean,
    /// Some pages could not be written this time
    Partial,
    /// The inode was dirtied again during the write
    Redirtied {
        /// Pages dirtied during the write
        pages: u64,
    },
}

/// Outcome of [`InodeWriter::write_inode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeWriteResult {
    /// Pages written
    pub written: u64,
    pub status: WriteStatus,
}

impl InodeWriteResult {
    pub const fn clean(written: u64) -> Self {
        Self {
            written,
            status: WriteStatus::Clean,
        }
    }
}

/// I/O submission path
pub trait InodeWriter: Send + Sync {
    /// Write up to `budget` pages of `inode`. A zero budget on a
    /// timestamp-only inode writes the timestamps.
    fn write_inode(&self, inode: &DirtyInode, budget: u64) -> InodeWriteResult;
}

/// Deferred execution service of the embedder
pub trait WorkScheduler: Send + Sync {
    /// Run the executor on `ctx` after `delay_ms`. Must not run it inline.
    fn schedule(&self, ctx: ContextRef, delay_ms: u64);
}

/// Scheduler that records requests until they are collected.
///
/// Useful for simulations and tests driving time by hand.
pub struct RecordingScheduler {
    clock: Arc<dyn Clock>,
    pending: Mutex<Vec<(u64, ContextRef)>>,
}

impl RecordingScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Remove and return requests due at `now_ms`
    pub fn take_due(&self, now_ms: u64) -> Vec<ContextRef> {
        let mut due = Vec::new();
        let mut pending = self.pending.lock();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].0 <= now_ms {
                due.push(pending.swap_remove(i).1);
            } else {
                i += 1;
            }
        }
        due
    }

    /// Remove and return every request
    pub fn take_all(&self) -> Vec<ContextRef> {
        let pending = core::mem::take(&mut *self.pending.lock());
        pending.into_iter().map(|(_, ctx)| ctx).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkScheduler for RecordingScheduler {
    fn schedule(&self, ctx: ContextRef, delay_ms: u64) {
        let due = self.clock.now_ms().saturating_add(delay_ms);
        self.pending.lock().push((due, ctx));
    }
}

impl fmt::Debug for RecordingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingScheduler")
            .field("pending", &self.len())
            .finish()
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// What one executor run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another run held the context
    pub busy: bool,
    /// Work items finished
    pub items: usize,
    pub inodes: usize,
    pub pages_written: u64,
    /// A start-all request was served
    pub start_all: bool,
    /// A periodic flush ran
    pub periodic: bool,
}

/// Per-context work runner
pub struct Executor {
    writer: Arc<dyn InodeWriter>,
}

impl Executor {
    pub fn new(writer: Arc<dyn InodeWriter>) -> Self {
        Self { writer }
    }

    /// Drain everything pending on `ctx`
    pub fn run(&self, ctx: &ContextRef) -> WbResult<DrainReport> {
        ctx.scheduled_due_ms
            .store(NOT_SCHEDULED, core::sync::atomic::Ordering::Release);
        let device = ctx.device()?;
        let mut report = DrainReport::default();

        let Some(guard) = ctx.drain.try_lock() else {
            report.busy = true;
            return Ok(report);
        };
        ctx.test_and_set(ContextFlags::WRITEBACK_RUNNING);

        loop {
            let items: Vec<WritebackWork> = ctx.work.lock().drain(..).collect();
            if !items.is_empty() {
                for item in items {
                    self.process(ctx, &device, &item, &mut report);
                    item.finish();
                    report.items += 1;
                }
                continue;
            }

            if let Some(reason) = ctx.take_start_all() {
                self.process(ctx, &device, &WritebackWork::new(0, reason), &mut report);
                report.start_all = true;
                continue;
            }

            if self.periodic_flush_due(ctx, &device) {
                self.process(ctx, &device, &WritebackWork::periodic(), &mut report);
                report.periodic = true;
            }
            break;
        }

        ctx.test_and_clear(ContextFlags::WRITEBACK_RUNNING);
        drop(guard);

        // Items queued after the last drain saw the context as scheduled.
        if !ctx.work.lock().is_empty() {
            work::wakeup(ctx, &device, 0);
        }

        log::trace!(
            "writeback: context {} drained {} items, {} pages",
            ctx.id(),
            report.items,
            report.pages_written
        );
        Ok(report)
    }

    fn periodic_flush_due(&self, ctx: &ContextRef, device: &Device) -> bool {
        let config = &device.shared.config;
        let now = device.shared.clock.now_ms();
        let mut io = ctx.io.lock();
        if !ctx.periodic_due(&io, config, now) {
            return false;
        }
        io.last_old_flush_ms = now;
        io.queues
            .has_expired(now.saturating_sub(config.dirty_expire_ms))
            || io
                .queues
                .has_expired_time(now.saturating_sub(config.dirtytime_expire_ms))
    }

    fn process(
        &self,
        ctx: &ContextRef,
        device: &Device,
        item: &WritebackWork,
        report: &mut DrainReport,
    ) {
        let config = &device.shared.config;
        let clock = &device.shared.clock;
        let now = clock.now_ms();

        let (cutoff, time_cutoff) = if item.for_kupdate {
            (
                Some(now.saturating_sub(config.dirty_expire_ms)),
                Some(now.saturating_sub(config.dirtytime_expire_ms)),
            )
        } else if item.sync_mode == SyncMode::All || item.reason == WritebackReason::Sync {
            (None, Some(u64::MAX))
        } else {
            (None, None)
        };
        ctx.io.lock().queues.queue_io(cutoff, time_cutoff);

        let mut budget = if item.nr_pages == 0 {
            u64::MAX
        } else {
            item.nr_pages
        };

        while budget > 0 {
            if item.for_background && !ctx.over_background_thresh_on(device) {
                break;
            }
            let Some(inode) = ctx.io.lock().queues.pop_io() else {
                break;
            };

            let request = if inode.time_only {
                0
            } else {
                inode.pages.min(budget)
            };
            ctx.add_stat(StatItem::Writeback, request as i64);
            let result = self.writer.write_inode(&inode, request);
            ctx.add_stat(StatItem::Writeback, -(request as i64));

            let written = result.written.min(inode.pages);
            let remaining = inode.pages - written;
            ctx.add_stat(StatItem::Written, written as i64);
            ctx.add_stat(StatItem::Reclaimable, -(written as i64));
            ctx.completions
                .inc_max(&device.completions, written, device.max_prop_frac());

            {
                let mut io = ctx.io.lock();
                match result.status {
                    WriteStatus::Partial if remaining > 0 || inode.time_only => {
                        io.queues.requeue(
                            DirtyInode {
                                pages: remaining,
                                ..inode
                            },
                            QueueKind::MoreIo,
                        );
                    },
                    WriteStatus::Clean | WriteStatus::Partial => {
                        // Pages the writer found already clean.
                        ctx.add_stat(StatItem::Reclaimable, -(remaining as i64));
                    },
                    WriteStatus::Redirtied { pages } => {
                        ctx.add_stat(StatItem::Reclaimable, pages as i64);
                        ctx.add_stat(StatItem::Dirtied, pages as i64);
                        io.queues.requeue(
                            DirtyInode {
                                pages: remaining + pages,
                                dirtied_at_ms: clock.now_ms(),
                                time_only: false,
                                ..inode
                            },
                            QueueKind::Dirty,
                        );
                    },
                }
                ctx.sync_dirty_io(device, &io);
            }

            budget = budget.saturating_sub(written.max(1));
            report.inodes += 1;
            report.pages_written += written;
        }

        ctx.update_bandwidth(device, clock.now_ms());
        ctx.update_congestion(device);
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::config::WritebackConfig;
    use crate::device::Capabilities;
    use crate::registry::DeviceRegistry;
    use crate::tenant::{IoClassId, TenantId};
    use crate::time::ManualClock;
    use crate::work::enqueue;

    /// Writes everything asked, or replays scripted outcomes per inode
    struct ScriptedWriter {
        script: Mutex<Vec<(u64, InodeWriteResult)>>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl ScriptedWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn script(&self, inode: u64, result: InodeWriteResult) {
            self.script.lock().push((inode, result));
        }
    }

    impl InodeWriter for ScriptedWriter {
        fn write_inode(&self, inode: &DirtyInode, budget: u64) -> InodeWriteResult {
            self.calls.lock().push((inode.inode, budget));
            let mut script = self.script.lock();
            if let Some(pos) = script.iter().position(|(i, _)| *i == inode.inode) {
                return script.remove(pos).1;
            }
            if budget < inode.pages {
                InodeWriteResult {
                    written: budget,
                    status: WriteStatus::Partial,
                }
            } else {
                InodeWriteResult::clean(inode.pages)
            }
        }
    }

    struct Harness {
        registry: DeviceRegistry,
        clock: Arc<ManualClock>,
        scheduler: Arc<RecordingScheduler>,
        writer: Arc<ScriptedWriter>,
        executor: Executor,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(RecordingScheduler::new(clock.clone()));
        let registry =
            DeviceRegistry::new(WritebackConfig::default(), clock.clone(), scheduler.clone())
                .unwrap();
        let writer = ScriptedWriter::new();
        Harness {
            registry,
            clock,
            scheduler,
            executor: Executor::new(writer.clone()),
            writer,
        }
    }

    #[test]
    fn test_sync_drains_and_completes() {
        let h = harness();
        let device = h.registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let ctx = device.lookup_or_create(TenantId(1), IoClassId(1));
        ctx.mark_dirty(1, 10).unwrap();
        ctx.mark_dirty(2, 20).unwrap();
        ctx.mark_dirty_time(3).unwrap();

        let done = Arc::new(device.new_completion());
        enqueue(&ctx, WritebackWork::sync().with_completion(done.clone())).unwrap();
        for ctx in h.scheduler.take_all() {
            let report = h.executor.run(&ctx).unwrap();
            assert_eq!(report.items, 1);
            assert_eq!(report.pages_written, 30);
            assert_eq!(report.inodes, 3);
        }
        done.wait();

        assert_eq!(done.releases(), 1);
        assert!(ctx.io.lock().queues.is_empty());
        assert!(!ctx.has_dirty_io());
        assert_eq!(ctx.stat_sum(StatItem::Written), 30);
        assert_eq!(ctx.stat_sum(StatItem::Reclaimable), 0);
        assert_eq!(ctx.stat_sum(StatItem::Writeback), 0);
        assert_eq!(ctx.completions.events(), 30);
    }

    #[test]
    fn test_budget_leaves_partial_inode_on_more_io() {
        let h = harness();
        let device = h.registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        root.mark_dirty(1, 100).unwrap();

        enqueue(&root, WritebackWork::new(40, WritebackReason::Vmscan)).unwrap();
        let run = h.scheduler.take_all();
        h.executor.run(&run[0]).unwrap();

        assert_eq!(root.io.lock().queues.kind_of(1), Some(QueueKind::MoreIo));
        assert_eq!(root.io.lock().queues.get(1).unwrap().pages, 60);
        assert!(root.has_dirty_io());
        assert_eq!(h.writer.calls.lock().as_slice(), &[(1, 40)]);
    }

    #[test]
    fn test_fully_written_partial_counts_as_clean() {
        let h = harness();
        let device = h.registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        root.mark_dirty(7, 16).unwrap();
        h.writer.script(
            7,
            InodeWriteResult {
                written: 16,
                status: WriteStatus::Partial,
            },
        );

        enqueue(&root, WritebackWork::sync()).unwrap();
        for ctx in h.scheduler.take_all() {
            h.executor.run(&ctx).unwrap();
        }

        assert!(root.io.lock().queues.is_empty());
        assert!(!root.has_dirty_io());
        assert_eq!(device.write_bandwidth(), 0);
        assert_eq!(root.stat_sum(StatItem::Reclaimable), 0);
    }

    #[test]
    fn test_background_pass_stops_below_threshold() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(RecordingScheduler::new(clock.clone()));
        let config = WritebackConfig::default()
            .with_dirty_limits(crate::config::DirtyLimits::new(1000, 500));
        let registry = DeviceRegistry::new(config, clock, scheduler.clone()).unwrap();
        let executor = Executor::new(ScriptedWriter::new());
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        for inode in 1..=4 {
            root.mark_dirty(inode, 200).unwrap();
        }

        enqueue(&root, WritebackWork::background()).unwrap();
        let mut written = 0;
        for ctx in scheduler.take_all() {
            written += executor.run(&ctx).unwrap().pages_written;
        }

        assert_eq!(written, 400);
        assert_eq!(root.stat_sum(StatItem::Reclaimable), 400);
        assert_eq!(root.queue_lens().io, 2);
        assert!(root.has_dirty_io());
    }

    #[test]
    fn test_redirtied_inode_is_requeued() {
        let h = harness();
        let device = h.registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        root.mark_dirty(5, 8).unwrap();
        h.writer.script(
            5,
            InodeWriteResult {
                written: 8,
                status: WriteStatus::Redirtied { pages: 3 },
            },
        );

        enqueue(&root, WritebackWork::sync()).unwrap();
        h.clock.advance(10);
        for ctx in h.scheduler.take_all() {
            h.executor.run(&ctx).unwrap();
        }

        {
            let io = root.io.lock();
            assert_eq!(io.queues.kind_of(5), Some(QueueKind::Dirty));
            assert_eq!(io.queues.get(5).unwrap().pages, 3);
        }
        assert_eq!(root.stat_sum(StatItem::Reclaimable), 3);
        assert_eq!(root.stat_sum(StatItem::Dirtied), 11);
    }

    #[test]
    fn test_drain_is_serialized() {
        let h = harness();
        let device = h.registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        let guard = root.drain.lock();
        enqueue(&root, WritebackWork::sync()).unwrap();
        let report = h.executor.run(&root).unwrap();
        assert!(report.busy);
        assert_eq!(root.work.lock().len(), 1);
        drop(guard);
        assert_eq!(h.executor.run(&root).unwrap().items, 1);
    }

    #[test]
    fn test_start_all_and_periodic_when_idle() {
        let h = harness();
        let config = h.registry.config().clone();
        let device = h.registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();

        root.mark_dirty(1, 4).unwrap();
        assert!(work::start_all(&root, WritebackReason::Background).unwrap());
        let report = h.executor.run(&root).unwrap();
        assert!(report.start_all);
        assert_eq!(report.pages_written, 4);
        assert!(!root.flags().contains(ContextFlags::START_ALL));

        h.clock.advance(1);
        root.mark_dirty(2, 6).unwrap();
        h.clock.advance(config.writeback_interval_ms);
        assert!(!h.executor.run(&root).unwrap().periodic);

        h.clock.advance(config.dirty_expire_ms);
        let report = h.executor.run(&root).unwrap();
        assert!(report.periodic);
        assert_eq!(report.pages_written, 6);
        assert_eq!(root.reason_count(WritebackReason::Background), 1);
    }

    #[test]
    fn test_hundred_items_share_one_completion() {
        let h = harness();
        let device = h.registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        let done = Arc::new(Completion::new(device.waitq().clone()));
        for inode in 0..100 {
            root.mark_dirty(inode, 1).unwrap();
            enqueue(
                &root,
                WritebackWork::new(1, WritebackReason::Sync).with_completion(done.clone()),
            )
            .unwrap();
        }
        assert_eq!(done.pending(), 101);
        for ctx in h.scheduler.take_all() {
            assert_eq!(h.executor.run(&ctx).unwrap().items, 100);
        }
        assert_eq!(done.pending(), 1);
        assert_eq!(done.releases(), 0);
        done.wait();
        assert_eq!(done.releases(), 1);
    }
}
