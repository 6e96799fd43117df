//! Deferred context release.
//!
//! Dropping the last reference of a tenant context only unlinks it and
//! queues it here. The embedder drains the queue from a task that may
//! block (`DeviceRegistry::run_release_work`); the optional notifier tells
//! it there is something to drain.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::{Mutex, RwLock};

use crate::context::{StatItem, WritebackContext};

/// Hook run after a context was queued for release
pub type ReleaseNotifier = fn();

/// Contexts waiting for release
pub(crate) struct ReleaseQueue {
    queue: Mutex<VecDeque<Arc<WritebackContext>>>,
    notifier: RwLock<Option<ReleaseNotifier>>,
}

impl ReleaseQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notifier: RwLock::new(None),
        }
    }

    pub(crate) fn set_notifier(&self, notifier: Option<ReleaseNotifier>) {
        *self.notifier.write() = notifier;
    }

    pub(crate) fn push(&self, ctx: Arc<WritebackContext>) {
        self.queue.lock().push_back(ctx);
        if let Some(notify) = *self.notifier.read() {
            notify();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Release everything queued so far; returns how many contexts
    pub(crate) fn run(&self) -> usize {
        let batch: Vec<_> = self.queue.lock().drain(..).collect();
        let released = batch.len();
        for ctx in batch {
            release_context(&ctx);
        }
        released
    }
}

impl fmt::Debug for ReleaseQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Tear down a dying context.
///
/// Leftover work is completed, queued inodes and their dirty pages move to
/// the device's root context, the context's share of the aggregate
/// bandwidth is withdrawn and the device link is cut.
fn release_context(ctx: &Arc<WritebackContext>) {
    let Ok(device) = ctx.device() else {
        ctx.mark_released();
        return;
    };
    let _drain = ctx.drain.lock();

    let leftovers: Vec<_> = {
        let mut work = ctx.work.lock();
        ctx.test_and_clear(crate::context::ContextFlags::REGISTERED);
        work.drain(..).collect()
    };
    for item in leftovers {
        item.finish();
    }

    let inodes = {
        let mut io = ctx.io.lock();
        let inodes = io.queues.take_all();
        ctx.sync_dirty_io(&device, &io);
        ctx.mark_released();
        inodes
    };

    let reclaimable = ctx.stat_sum(StatItem::Reclaimable);
    if !inodes.is_empty() || reclaimable > 0 {
        let root = device.root_context();
        let mut io = root.io.lock();
        io.queues.absorb(inodes);
        root.add_stat(StatItem::Reclaimable, reclaimable as i64);
        root.sync_dirty_io(&device, &io);
    }
    ctx.reset_stats();

    device.forget(ctx);
    ctx.detach_device();
    log::debug!(
        "writeback: released context {} of device {}",
        ctx.id(),
        device.id()
    );
}
