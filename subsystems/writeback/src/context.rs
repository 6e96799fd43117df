//! # Writeback Context
//!
//! One context per (device, tenant) pair; the root context stands for the
//! device itself. A context owns the dirty inode queues of its tenant on
//! that device, the statistics and bandwidth state derived from them and a
//! queue of pending flush work.
//!
//! ## Locks
//!
//! ```text
//!   io    (list lock)  queues, bandwidth state, has-dirty-io transitions
//!   work  (work lock)  pending work items, registered bit checks
//!   drain              held by the executor for a whole pass
//! ```
//!
//! `io` and `work` are never held together except by release, which takes
//! them one after the other.
//!
//! ## Lifecycle
//!
//! ```text
//!   Uninitialized ──▶ Active ──(refcount 0)──▶ Dying ──(release task)──▶ Released
//! ```
//!
//! Tenant contexts are reference counted. The device index owns one base
//! reference, dropped when the context is unlinked (stale class, tenant
//! offline, device unregister). When the count reaches zero the context is
//! unlinked from every lookup structure right away and queued for release;
//! the release itself runs later from the release task. The root context
//! ignores reference counting and stays Active for its device's lifetime.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use crate::bandwidth::{BandwidthSample, BandwidthState, BandwidthUpdate};
use crate::config::WritebackConfig;
use crate::counter::ShardedCounter;
use crate::device::{Capabilities, Device};
use crate::error::{report_fault, WbError, WbResult};
use crate::proportion::{PropGlobal, PropLocal};
use crate::queues::{InodeId, InodeQueues, QueueLens};
use crate::tenant::{IoClassId, TenantId, TenantKey};
use crate::time::{elapsed_ms, MSEC_PER_SEC};
use crate::work::{WritebackReason, WritebackWork};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// `scheduled_due_ms` of a context with no executor run pending
pub(crate) const NOT_SCHEDULED: u64 = u64::MAX;

// =============================================================================
// FLAGS & STATE
// =============================================================================

bitflags! {
    /// Context state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// Accepts work
        const REGISTERED = 1 << 0;
        /// Executor pass in progress
        const WRITEBACK_RUNNING = 1 << 1;
        /// Has inodes with dirty data; counted in the device aggregate
        const HAS_DIRTY_IO = 1 << 2;
        /// A flush-everything request is pending
        const START_ALL = 1 << 3;
    }
}

bitflags! {
    /// Congestion bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Congestion: u32 {
        /// Asynchronous (buffered) backlog over threshold
        const ASYNC = 1 << 0;
        /// Synchronous (in-flight) backlog over threshold
        const SYNC = 1 << 1;
    }
}

/// Congestion channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionChannel {
    Async,
    Sync,
}

impl CongestionChannel {
    /// Bit of this channel in the congestion word
    pub const fn bit(self) -> Congestion {
        match self {
            CongestionChannel::Async => Congestion::ASYNC,
            CongestionChannel::Sync => Congestion::SYNC,
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Uninitialized = 0,
    Active        = 1,
    Dying         = 2,
    Released      = 3,
}

impl ContextState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => ContextState::Active,
            2 => ContextState::Dying,
            3 => ContextState::Released,
            _ => ContextState::Uninitialized,
        }
    }
}

/// Statistics counters of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatItem {
    /// Dirty pages waiting for writeback
    Reclaimable = 0,
    /// Pages under writeback
    Writeback   = 1,
    /// Pages dirtied, cumulative
    Dirtied     = 2,
    /// Pages written, cumulative
    Written     = 3,
}

/// Number of statistics counters
pub const NR_STAT_ITEMS: usize = 4;

impl StatItem {
    /// Every counter
    pub const ALL: [StatItem; NR_STAT_ITEMS] = [
        StatItem::Reclaimable,
        StatItem::Writeback,
        StatItem::Dirtied,
        StatItem::Written,
    ];
}

/// State guarded by the list lock
#[derive(Debug)]
pub(crate) struct IoState {
    pub(crate) queues: InodeQueues,
    pub(crate) bandwidth: BandwidthState,
    pub(crate) last_old_flush_ms: u64,
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Per (device, tenant) writeback unit
pub struct WritebackContext {
    id: u64,
    tenant: Option<TenantKey>,
    this: Weak<WritebackContext>,
    device: RwLock<Option<Weak<Device>>>,

    state: AtomicU8,
    flags: AtomicU32,
    congestion: AtomicU32,
    refcount: AtomicUsize,
    indexed: AtomicBool,

    pub(crate) io: Mutex<IoState>,
    pub(crate) work: Mutex<VecDeque<WritebackWork>>,
    pub(crate) drain: Mutex<()>,
    /// Due time of the pending executor run, `NOT_SCHEDULED` if none
    pub(crate) scheduled_due_ms: AtomicU64,

    stats: [ShardedCounter; NR_STAT_ITEMS],
    pub(crate) completions: PropLocal,

    dirty_exceeded: AtomicBool,
    dirty_ratelimit: AtomicU64,
    avg_write_bandwidth: AtomicU64,
    dirty_sleep_ms: AtomicU64,
    start_all_reason: AtomicU8,
    reasons: [AtomicU64; WritebackReason::COUNT],
}

impl WritebackContext {
    /// Build a context. Tenant contexts start with two references: the
    /// device index's base reference and the caller's.
    pub(crate) fn new(
        tenant: Option<TenantKey>,
        device: Weak<Device>,
        config: &WritebackConfig,
        global: &PropGlobal,
        now_ms: u64,
        registered: bool,
    ) -> Arc<Self> {
        let flags = if registered {
            ContextFlags::REGISTERED
        } else {
            ContextFlags::empty()
        };
        let shards = config.counter_shards;
        let batch = config.counter_batch;
        Arc::new_cyclic(|this| Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            tenant,
            this: this.clone(),
            device: RwLock::new(Some(device)),
            state: AtomicU8::new(ContextState::Active as u8),
            flags: AtomicU32::new(flags.bits()),
            congestion: AtomicU32::new(0),
            refcount: AtomicUsize::new(if tenant.is_some() { 2 } else { 1 }),
            indexed: AtomicBool::new(tenant.is_some()),
            io: Mutex::new(IoState {
                queues: InodeQueues::new(),
                bandwidth: BandwidthState::new(now_ms, config),
                last_old_flush_ms: now_ms,
            }),
            work: Mutex::new(VecDeque::new()),
            drain: Mutex::new(()),
            scheduled_due_ms: AtomicU64::new(NOT_SCHEDULED),
            stats: core::array::from_fn(|_| ShardedCounter::new(shards, batch)),
            completions: PropLocal::new(config, global),
            dirty_exceeded: AtomicBool::new(false),
            dirty_ratelimit: AtomicU64::new(config.init_ratelimit),
            avg_write_bandwidth: AtomicU64::new(0),
            dirty_sleep_ms: AtomicU64::new(now_ms),
            start_all_reason: AtomicU8::new(0),
            reasons: core::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Unique context id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tenant key, `None` for the root context
    pub fn tenant(&self) -> Option<TenantKey> {
        self.tenant
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant.map(|k| k.tenant)
    }

    pub fn io_class(&self) -> Option<IoClassId> {
        self.tenant.map(|k| k.io_class)
    }

    /// Whether this is the device's root context
    pub fn is_root(&self) -> bool {
        self.tenant.is_none()
    }

    /// Owning device.
    ///
    /// A context without a device link is an invariant violation, reported
    /// through the fault channel.
    pub fn device(&self) -> WbResult<Arc<Device>> {
        self.device
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| report_fault(WbError::OrphanContext, "context::device"))
    }

    pub(crate) fn detach_device(&self) {
        *self.device.write() = None;
    }

    // -------------------------------------------------------------------------
    // Reference counting
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current reference count; zero for the root context
    pub fn refcount(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.refcount.load(Ordering::Acquire)
        }
    }

    /// Whether the device index still holds this context
    pub fn is_indexed(&self) -> bool {
        self.indexed.load(Ordering::Acquire)
    }

    /// Take a reference. The caller must already hold one.
    pub fn get(&self) {
        if self.is_root() {
            return;
        }
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Take a reference unless the context is dying
    pub fn try_get(&self) -> bool {
        if self.is_root() {
            return true;
        }
        if self.state() != ContextState::Active {
            return false;
        }
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c == 0 {
                    None
                } else {
                    Some(c + 1)
                }
            })
            .is_ok()
    }

    /// Drop a reference; the last one unlinks the context and queues its
    /// release.
    pub fn put(&self) -> WbResult<()> {
        if self.is_root() {
            return Ok(());
        }
        let prev = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .map_err(|_| report_fault(WbError::RefcountUnderflow, "context::put"))?;
        if prev == 1 {
            self.kill();
        }
        Ok(())
    }

    /// Reference-holding handle, if the context is still alive
    pub fn try_ref(self: &Arc<Self>) -> Option<ContextRef> {
        if self.try_get() {
            Some(ContextRef::adopt(self.clone()))
        } else {
            None
        }
    }

    /// Drop the device index's base reference, once
    pub(crate) fn drop_index_ref(&self) {
        if self.indexed.swap(false, Ordering::AcqRel) {
            let _ = self.put();
        }
    }

    fn kill(&self) {
        if self
            .state
            .compare_exchange(
                ContextState::Active as u8,
                ContextState::Dying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let Ok(device) = self.device() else {
            return;
        };
        device.unlink(self);
        self.indexed.store(false, Ordering::Release);
        log::debug!("writeback: context {} on device {} dying", self.id, device.id());
        if let Some(this) = self.this.upgrade() {
            device.shared.releases.push(this);
        }
    }

    pub(crate) fn mark_released(&self) {
        self.state
            .store(ContextState::Released as u8, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Flags
    // -------------------------------------------------------------------------

    pub fn flags(&self) -> ContextFlags {
        ContextFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set `flag`, returning whether it was already set
    pub(crate) fn test_and_set(&self, flag: ContextFlags) -> bool {
        let prev = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        prev & flag.bits() != 0
    }

    /// Clear `flag`, returning whether it was set
    pub(crate) fn test_and_clear(&self, flag: ContextFlags) -> bool {
        let prev = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        prev & flag.bits() != 0
    }

    pub fn is_registered(&self) -> bool {
        self.flags().contains(ContextFlags::REGISTERED)
    }

    pub fn has_dirty_io(&self) -> bool {
        self.flags().contains(ContextFlags::HAS_DIRTY_IO)
    }

    pub fn is_writeback_running(&self) -> bool {
        self.flags().contains(ContextFlags::WRITEBACK_RUNNING)
    }

    pub(crate) fn set_start_all_reason(&self, reason: WritebackReason) {
        self.start_all_reason
            .store(reason as u8, Ordering::Release);
    }

    pub(crate) fn take_start_all(&self) -> Option<WritebackReason> {
        if !self.test_and_clear(ContextFlags::START_ALL) {
            return None;
        }
        Some(WritebackReason::from_u8(
            self.start_all_reason.load(Ordering::Acquire),
        ))
    }

    /// Bring the device aggregate in line with the queues. Call with the
    /// list lock held.
    pub(crate) fn sync_dirty_io(&self, device: &Device, io: &IoState) {
        let has = io.queues.has_dirty_io();
        if has == self.has_dirty_io() {
            return;
        }
        let avg = io.bandwidth.avg_write_bandwidth;
        if has {
            self.test_and_set(ContextFlags::HAS_DIRTY_IO);
            device.add_write_bandwidth(avg);
        } else {
            self.test_and_clear(ContextFlags::HAS_DIRTY_IO);
            device.sub_write_bandwidth(avg);
        }
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Approximate value of `item`
    pub fn stat(&self, item: StatItem) -> i64 {
        self.stats[item as usize].read()
    }

    /// Accurate value of `item`, clamped at zero
    pub fn stat_sum(&self, item: StatItem) -> u64 {
        self.stats[item as usize].sum_positive()
    }

    pub(crate) fn add_stat(&self, item: StatItem, delta: i64) {
        self.stats[item as usize].add(delta);
    }

    pub(crate) fn consolidate(&self) {
        for counter in &self.stats {
            counter.consolidate();
        }
        self.completions.consolidate();
    }

    pub(crate) fn reset_stats(&self) {
        for counter in &self.stats {
            counter.set(0);
        }
        self.completions.reset();
    }

    pub(crate) fn count_reason(&self, reason: WritebackReason) {
        self.reasons[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Work items received for `reason`
    pub fn reason_count(&self, reason: WritebackReason) -> u64 {
        self.reasons[reason as usize].load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Dirtying
    // -------------------------------------------------------------------------

    /// Attach `pages` dirty pages of `inode` to this context
    pub fn mark_dirty(&self, inode: InodeId, pages: u64) -> WbResult<()> {
        let device = self.device()?;
        let now = device.shared.clock.now_ms();
        let mut io = self.io.lock();
        if self.state() == ContextState::Released {
            return Err(WbError::ContextReleased);
        }
        io.queues.mark_dirty(inode, pages, now);
        self.add_stat(StatItem::Reclaimable, pages as i64);
        self.add_stat(StatItem::Dirtied, pages as i64);
        self.sync_dirty_io(&device, &io);
        Ok(())
    }

    /// Mark only the timestamps of `inode` dirty
    pub fn mark_dirty_time(&self, inode: InodeId) -> WbResult<()> {
        self.mark_dirty(inode, 0)
    }

    /// Queue lengths
    pub fn queue_lens(&self) -> QueueLens {
        self.io.lock().queues.lens()
    }

    // -------------------------------------------------------------------------
    // Bandwidth & congestion
    // -------------------------------------------------------------------------

    /// Smoothed write bandwidth (pages/s)
    pub fn avg_write_bandwidth(&self) -> u64 {
        self.avg_write_bandwidth.load(Ordering::Acquire)
    }

    /// Enforced dirty ratelimit (pages/s)
    pub fn dirty_ratelimit(&self) -> u64 {
        self.dirty_ratelimit.load(Ordering::Acquire)
    }

    pub fn dirty_exceeded(&self) -> bool {
        self.dirty_exceeded.load(Ordering::Acquire)
    }

    /// Last time a producer was told to back off
    pub fn dirty_sleep_ms(&self) -> u64 {
        self.dirty_sleep_ms.load(Ordering::Acquire)
    }

    /// Run the bandwidth estimator if the sampling interval elapsed
    pub(crate) fn update_bandwidth(&self, device: &Device, now_ms: u64) -> Option<BandwidthUpdate> {
        let config = &device.shared.config;
        let share = self.completions.fraction(&device.completions);
        let (thresh, bg_thresh) = device.context_thresholds(share);
        let sample = BandwidthSample {
            now_ms,
            written: self.stat_sum(StatItem::Written),
            dirtied: self.stat_sum(StatItem::Dirtied),
            dirty_pages: self.stat_sum(StatItem::Reclaimable),
            thresh,
            bg_thresh,
            strict: device.capabilities().contains(Capabilities::STRICTLIMIT),
        };

        let mut io = self.io.lock();
        let update = io.bandwidth.update(&sample, config)?;
        if self.has_dirty_io() {
            device.adjust_write_bandwidth(update.old_avg, update.new_avg);
        }
        self.avg_write_bandwidth
            .store(update.new_avg, Ordering::Release);
        self.dirty_ratelimit
            .store(io.bandwidth.dirty_ratelimit, Ordering::Release);
        self.dirty_exceeded
            .store(update.dirty_exceeded, Ordering::Release);
        Some(update)
    }

    /// Whether dirty pages are above this context's background threshold
    pub fn over_background_thresh(&self) -> WbResult<bool> {
        let device = self.device()?;
        Ok(self.over_background_thresh_on(&device))
    }

    pub(crate) fn over_background_thresh_on(&self, device: &Device) -> bool {
        let share = self.completions.fraction(&device.completions);
        let (_, bg_thresh) = device.context_thresholds(share);
        self.stat_sum(StatItem::Reclaimable) > bg_thresh
    }

    /// Pause a producer dirtying `pages` pages should take, in milliseconds.
    ///
    /// Records the back-off time when the pause is non-zero.
    pub fn throttle_pause_ms(&self, pages: u64) -> WbResult<u64> {
        let device = self.device()?;
        let ratelimit = self.dirty_ratelimit().max(1);
        let pause = (pages.saturating_mul(MSEC_PER_SEC) / ratelimit)
            .min(device.shared.config.max_pause_ms);
        if pause > 0 {
            self.dirty_sleep_ms
                .store(device.shared.clock.now_ms(), Ordering::Release);
        }
        Ok(pause)
    }

    pub fn congestion(&self) -> Congestion {
        Congestion::from_bits_truncate(self.congestion.load(Ordering::Acquire))
    }

    pub fn is_congested(&self, channel: CongestionChannel) -> bool {
        self.congestion().contains(channel.bit())
    }

    pub fn set_congested(&self, channel: CongestionChannel) {
        self.congestion
            .fetch_or(channel.bit().bits(), Ordering::AcqRel);
    }

    pub fn clear_congested(&self, channel: CongestionChannel) {
        self.congestion
            .fetch_and(!channel.bit().bits(), Ordering::AcqRel);
    }

    /// Raise or drop the congestion bits against the device thresholds
    pub(crate) fn update_congestion(&self, device: &Device) {
        let thresholds = device.congestion_thresholds();
        let backlog = self.stat_sum(StatItem::Reclaimable);
        let inflight = self.stat_sum(StatItem::Writeback);
        for (channel, over) in [
            (CongestionChannel::Async, backlog > thresholds.async_pages),
            (CongestionChannel::Sync, inflight > thresholds.sync_pages),
        ] {
            if over {
                self.set_congested(channel);
            } else {
                self.clear_congested(channel);
            }
        }
    }

    /// Whether a periodic flush is due at `now_ms`
    pub(crate) fn periodic_due(&self, io: &IoState, config: &WritebackConfig, now_ms: u64) -> bool {
        elapsed_ms(now_ms, io.last_old_flush_ms) >= config.writeback_interval_ms
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Snapshot of the context
    pub fn stats(&self) -> ContextStats {
        let (queues, bandwidth) = {
            let io = self.io.lock();
            (io.queues.lens(), io.bandwidth.clone())
        };
        ContextStats {
            id: self.id,
            tenant: self.tenant,
            state: self.state(),
            flags: self.flags(),
            congestion: self.congestion(),
            refcount: self.refcount(),
            reclaimable: self.stat_sum(StatItem::Reclaimable),
            writeback: self.stat_sum(StatItem::Writeback),
            dirtied: self.stat_sum(StatItem::Dirtied),
            written: self.stat_sum(StatItem::Written),
            write_bandwidth: bandwidth.write_bandwidth,
            avg_write_bandwidth: bandwidth.avg_write_bandwidth,
            dirty_rate: bandwidth.dirty_rate,
            dirty_ratelimit: bandwidth.dirty_ratelimit,
            balanced_dirty_ratelimit: bandwidth.balanced_dirty_ratelimit,
            dirty_exceeded: self.dirty_exceeded(),
            queues,
            reasons: core::array::from_fn(|i| self.reasons[i].load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for WritebackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritebackContext")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Point-in-time view of a context
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub id: u64,
    pub tenant: Option<TenantKey>,
    pub state: ContextState,
    pub flags: ContextFlags,
    pub congestion: Congestion,
    pub refcount: usize,
    pub reclaimable: u64,
    pub writeback: u64,
    pub dirtied: u64,
    pub written: u64,
    pub write_bandwidth: u64,
    pub avg_write_bandwidth: u64,
    pub dirty_rate: u64,
    pub dirty_ratelimit: u64,
    pub balanced_dirty_ratelimit: u64,
    pub dirty_exceeded: bool,
    pub queues: QueueLens,
    pub reasons: [u64; WritebackReason::COUNT],
}

// =============================================================================
// REFERENCE HANDLE
// =============================================================================

/// Counted reference to a context; dropping it puts the reference
pub struct ContextRef {
    ctx: Arc<WritebackContext>,
}

impl ContextRef {
    /// Wrap a reference the caller already took
    pub(crate) fn adopt(ctx: Arc<WritebackContext>) -> Self {
        Self { ctx }
    }

    /// The shared context
    pub fn arc(&self) -> &Arc<WritebackContext> {
        &self.ctx
    }

    /// Whether both handles name the same context
    pub fn ptr_eq(a: &ContextRef, b: &ContextRef) -> bool {
        Arc::ptr_eq(&a.ctx, &b.ctx)
    }
}

impl Deref for ContextRef {
    type Target = WritebackContext;

    fn deref(&self) -> &WritebackContext {
        &self.ctx
    }
}

impl Clone for ContextRef {
    fn clone(&self) -> Self {
        self.ctx.get();
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl Drop for ContextRef {
    fn drop(&mut self) {
        let _ = self.ctx.put();
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextRef").field(&self.ctx.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceParams;
    use crate::executor::RecordingScheduler;
    use crate::registry::DeviceRegistry;
    use crate::time::ManualClock;

    fn registry() -> (DeviceRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(RecordingScheduler::new(clock.clone()));
        let registry = DeviceRegistry::new(WritebackConfig::default(), clock.clone(), scheduler)
            .unwrap();
        (registry, clock)
    }

    #[test]
    fn test_root_ignores_refcount() {
        let (registry, _) = registry();
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        assert!(root.is_root());
        root.put().unwrap();
        root.put().unwrap();
        assert!(root.try_get());
        assert_eq!(root.state(), ContextState::Active);
    }

    #[test]
    fn test_second_put_past_zero_is_rejected() {
        let (registry, _) = registry();
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let ctx = device.lookup_or_create(TenantId(1), IoClassId(1));
        let arc = ctx.arc().clone();
        assert_eq!(arc.refcount(), 2);

        drop(ctx);
        assert_eq!(arc.refcount(), 1);
        arc.drop_index_ref();
        assert_eq!(arc.refcount(), 0);
        assert_eq!(arc.state(), ContextState::Dying);
        assert!(!arc.try_get());
        assert_eq!(arc.put(), Err(WbError::RefcountUnderflow));
        assert_eq!(arc.refcount(), 0);
    }

    #[test]
    fn test_dirtying_populates_aggregate() {
        let (registry, _) = registry();
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let ctx = device.lookup_or_create(TenantId(1), IoClassId(1));
        assert!(!ctx.has_dirty_io());
        ctx.mark_dirty(10, 8).unwrap();
        assert!(ctx.has_dirty_io());
        assert_eq!(ctx.stat_sum(StatItem::Reclaimable), 8);
        assert_eq!(ctx.stat_sum(StatItem::Dirtied), 8);

        ctx.mark_dirty_time(11).unwrap();
        assert_eq!(ctx.queue_lens().dirty_time, 1);
    }

    #[test]
    fn test_congestion_bits() {
        let (registry, _) = registry();
        let device = registry
            .create_with(DeviceParams::new("sda").with_congestion(
                crate::config::CongestionThresholds::new(4, 2),
            ))
            .unwrap();
        let root = device.root();
        root.set_congested(CongestionChannel::Sync);
        root.set_congested(CongestionChannel::Sync);
        assert!(root.is_congested(CongestionChannel::Sync));
        assert!(!root.is_congested(CongestionChannel::Async));

        root.mark_dirty(1, 10).unwrap();
        root.update_congestion(&device);
        assert_eq!(root.congestion(), Congestion::ASYNC);
        root.clear_congested(CongestionChannel::Async);
        assert!(root.congestion().is_empty());
    }

    #[test]
    fn test_throttle_pause_follows_ratelimit() {
        let (registry, clock) = registry();
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let root = device.root();
        clock.set(42);
        let ratelimit = root.dirty_ratelimit();
        assert_eq!(root.throttle_pause_ms(ratelimit / 100).unwrap(), 10);
        assert_eq!(root.dirty_sleep_ms(), 42);
        assert_eq!(
            root.throttle_pause_ms(u64::MAX).unwrap(),
            registry.config().max_pause_ms
        );
        assert_eq!(root.throttle_pause_ms(0).unwrap(), 0);
    }

    #[test]
    fn test_orphan_context_is_a_fault() {
        let (registry, _) = registry();
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let ctx = device.lookup_or_create(TenantId(3), IoClassId(1));
        ctx.detach_device();
        assert_eq!(ctx.mark_dirty(1, 1), Err(WbError::OrphanContext));
        assert_eq!(ctx.throttle_pause_ms(1), Err(WbError::OrphanContext));
    }
}
