//! # Backing Device
//!
//! A device owns its root context, the index of tenant contexts keyed by
//! tenant id and the aggregate write bandwidth of every context that has
//! dirty data.
//!
//! ```text
//!   Device
//!   ├── root ─────────────── WritebackContext (tenant = None)
//!   ├── buckets[16] ──────── RwLock<HashMap<TenantId, Arc<WritebackContext>>>
//!   ├── all ──────────────── every context, unlinked ones until released
//!   ├── barrier ──────────── write: sync_all   read: create / teardown
//!   ├── waitq ────────────── completion wake-ups
//!   └── tot_write_bandwidth  Σ avg_write_bandwidth over HAS_DIRTY_IO contexts
//! ```
//!
//! Lookups only take the bucket read lock. Creation and teardown take the
//! barrier shared and the bucket exclusively; a full synchronization pass
//! takes the barrier exclusively so no context appears or disappears while
//! it snapshots the device.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;
use spin::{Mutex, RwLock};
use static_assertions::const_assert;

use crate::completion::{Completion, WaitQueue};
use crate::config::CongestionThresholds;
use crate::context::{Congestion, CongestionChannel, ContextRef, WritebackContext};
use crate::error::{WbError, WbResult};
use crate::proportion::{PropGlobal, Share, FPROP_FRAC_BASE};
use crate::registry::RegistryShared;
use crate::tenant::{IoClassId, TenantId, TenantKey};
use crate::work::{self, WritebackWork};

/// Buckets of the per-device context index
pub const DEVICE_INDEX_BUCKETS: usize = 16;

const_assert!(DEVICE_INDEX_BUCKETS.is_power_of_two());

/// Readahead window of a new device (128 KiB of 4 KiB pages)
pub const DEFAULT_RA_PAGES: u64 = 32;

bitflags! {
    /// Device capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Dirty data is written back; without it work completes unexecuted
        const WRITEBACK = 1 << 0;
        /// Dirty and writeback pages are accounted
        const WRITEBACK_ACCT = 1 << 1;
        /// Contexts are held to their own threshold
        const STRICTLIMIT = 1 << 2;
    }
}

/// Creation parameters of a device
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub name: String,
    pub capabilities: Capabilities,
    /// Guaranteed share of the dirty threshold, percent
    pub min_ratio: u32,
    /// Maximum share of the dirty threshold, percent
    pub max_ratio: u32,
    pub ra_pages: u64,
    /// Maximum I/O size in pages
    pub io_pages: u64,
    /// Congestion thresholds; registry default if `None`
    pub congestion: Option<CongestionThresholds>,
}

impl DeviceParams {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            capabilities: Capabilities::WRITEBACK | Capabilities::WRITEBACK_ACCT,
            min_ratio: 0,
            max_ratio: 100,
            ra_pages: DEFAULT_RA_PAGES,
            io_pages: DEFAULT_RA_PAGES,
            congestion: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_ratios(mut self, min_ratio: u32, max_ratio: u32) -> Self {
        self.min_ratio = min_ratio;
        self.max_ratio = max_ratio;
        self
    }

    pub fn with_readahead(mut self, ra_pages: u64, io_pages: u64) -> Self {
        self.ra_pages = ra_pages;
        self.io_pages = io_pages;
        self
    }

    pub fn with_congestion(mut self, congestion: CongestionThresholds) -> Self {
        self.congestion = Some(congestion);
        self
    }

    pub(crate) fn validate(&self) -> WbResult<()> {
        if self.max_ratio > 100 || self.min_ratio > self.max_ratio {
            return Err(WbError::InvalidArgument);
        }
        Ok(())
    }
}

/// `max_ratio` expressed as a share fraction
fn prop_frac(max_ratio: u32) -> u64 {
    max_ratio as u64 * FPROP_FRAC_BASE / 100
}

// =============================================================================
// DEVICE
// =============================================================================

/// Writeback domain of one backing device
pub struct Device {
    id: u64,
    name: String,
    capabilities: Capabilities,
    min_ratio: AtomicU32,
    max_ratio: AtomicU32,
    max_prop_frac: AtomicU64,
    ra_pages: AtomicU64,
    io_pages: AtomicU64,
    registered: AtomicBool,

    tot_write_bandwidth: AtomicU64,
    pub(crate) completions: PropGlobal,
    congestion: RwLock<CongestionThresholds>,

    root: Arc<WritebackContext>,
    buckets: Box<[RwLock<HashMap<TenantId, Arc<WritebackContext>>>]>,
    all: Mutex<Vec<Arc<WritebackContext>>>,
    live_contexts: AtomicUsize,
    barrier: RwLock<()>,
    waitq: Arc<WaitQueue>,

    pub(crate) shared: Arc<RegistryShared>,
}

impl Device {
    pub(crate) fn new(id: u64, params: DeviceParams, shared: Arc<RegistryShared>) -> Arc<Self> {
        let now = shared.clock.now_ms();
        let congestion = params.congestion.unwrap_or(shared.config.congestion);
        Arc::new_cyclic(|this| {
            let completions = PropGlobal::new(&shared.config, now);
            let root = WritebackContext::new(
                None,
                this.clone(),
                &shared.config,
                &completions,
                now,
                params.capabilities.contains(Capabilities::WRITEBACK),
            );
            let buckets: Vec<_> = (0..DEVICE_INDEX_BUCKETS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect();
            Self {
                id,
                name: params.name,
                capabilities: params.capabilities,
                min_ratio: AtomicU32::new(params.min_ratio),
                max_ratio: AtomicU32::new(params.max_ratio),
                max_prop_frac: AtomicU64::new(prop_frac(params.max_ratio)),
                ra_pages: AtomicU64::new(params.ra_pages),
                io_pages: AtomicU64::new(params.io_pages),
                registered: AtomicBool::new(true),
                tot_write_bandwidth: AtomicU64::new(0),
                completions,
                congestion: RwLock::new(congestion),
                all: Mutex::new(alloc::vec![root.clone()]),
                root,
                buckets: buckets.into_boxed_slice(),
                live_contexts: AtomicUsize::new(0),
                barrier: RwLock::new(()),
                waitq: Arc::new(WaitQueue::new()),
                shared,
            }
        })
    }

    // -------------------------------------------------------------------------
    // Attributes
    // -------------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn min_ratio(&self) -> u32 {
        self.min_ratio.load(Ordering::Acquire)
    }

    pub fn max_ratio(&self) -> u32 {
        self.max_ratio.load(Ordering::Acquire)
    }

    /// `max_ratio` in share fixed point
    pub fn max_prop_frac(&self) -> u64 {
        self.max_prop_frac.load(Ordering::Acquire)
    }

    pub(crate) fn store_min_ratio(&self, ratio: u32) {
        self.min_ratio.store(ratio, Ordering::Release);
    }

    pub(crate) fn store_max_ratio(&self, ratio: u32) {
        self.max_ratio.store(ratio, Ordering::Release);
        self.max_prop_frac
            .store(prop_frac(ratio), Ordering::Release);
    }

    pub fn ra_pages(&self) -> u64 {
        self.ra_pages.load(Ordering::Relaxed)
    }

    pub fn set_ra_pages(&self, pages: u64) {
        self.ra_pages.store(pages, Ordering::Relaxed);
    }

    pub fn io_pages(&self) -> u64 {
        self.io_pages.load(Ordering::Relaxed)
    }

    pub fn set_io_pages(&self, pages: u64) {
        self.io_pages.store(pages, Ordering::Relaxed);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    pub fn congestion_thresholds(&self) -> CongestionThresholds {
        *self.congestion.read()
    }

    pub fn set_congestion_thresholds(&self, thresholds: CongestionThresholds) {
        *self.congestion.write() = thresholds;
    }

    /// Wait channel shared by completions of this device
    pub fn waitq(&self) -> &Arc<WaitQueue> {
        &self.waitq
    }

    /// Fresh completion signalling through this device
    pub fn new_completion(&self) -> Completion {
        Completion::new(self.waitq.clone())
    }

    // -------------------------------------------------------------------------
    // Bandwidth
    // -------------------------------------------------------------------------

    /// Aggregate write bandwidth of contexts with dirty data (pages/s)
    pub fn write_bandwidth(&self) -> u64 {
        self.tot_write_bandwidth.load(Ordering::Acquire)
    }

    pub(crate) fn add_write_bandwidth(&self, bw: u64) {
        self.tot_write_bandwidth.fetch_add(bw, Ordering::AcqRel);
    }

    pub(crate) fn sub_write_bandwidth(&self, bw: u64) {
        self.tot_write_bandwidth.fetch_sub(bw, Ordering::AcqRel);
    }

    pub(crate) fn adjust_write_bandwidth(&self, old: u64, new: u64) {
        if new >= old {
            self.add_write_bandwidth(new - old);
        } else {
            self.sub_write_bandwidth(old - new);
        }
    }

    /// Hard and background thresholds of a context holding `share`.
    ///
    /// The global limits are scaled by the share and clamped into the
    /// device's `[min_ratio, max_ratio]` band. A device without completion
    /// history hands out the full limits.
    pub(crate) fn context_thresholds(&self, share: Share) -> (u64, u64) {
        let limits = *self.shared.limits.read();
        let min_ratio = self.min_ratio() as u64;
        let max_ratio = self.max_ratio() as u64;
        let scale = |global: u64| {
            let base = if share.is_empty() {
                global
            } else {
                share.scale(global)
            };
            let lo = global * min_ratio / 100;
            let hi = (global * max_ratio / 100).max(lo);
            base.clamp(lo, hi)
        };
        (scale(limits.thresh_pages), scale(limits.bg_thresh_pages))
    }

    // -------------------------------------------------------------------------
    // Contexts
    // -------------------------------------------------------------------------

    /// The root context
    pub fn root(&self) -> ContextRef {
        ContextRef::adopt(self.root.clone())
    }

    pub(crate) fn root_context(&self) -> &Arc<WritebackContext> {
        &self.root
    }

    fn bucket(&self, tenant: TenantId) -> &RwLock<HashMap<TenantId, Arc<WritebackContext>>> {
        let hash = tenant.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.buckets[(hash >> 32) as usize & (DEVICE_INDEX_BUCKETS - 1)]
    }

    /// Live tenant context for `tenant`, without creating one
    pub fn find(&self, tenant: TenantId) -> Option<ContextRef> {
        self.bucket(tenant).read().get(&tenant)?.try_ref()
    }

    /// Context for `(tenant, io_class)`, created on first use.
    ///
    /// Never fails: an entry mapped to another I/O class is unlinked and
    /// replaced, and if a new context cannot be set up the root context
    /// is returned.
    pub fn lookup_or_create(self: &Arc<Self>, tenant: TenantId, io_class: IoClassId) -> ContextRef {
        if !self.capabilities.contains(Capabilities::WRITEBACK) {
            return self.root();
        }

        let stale = {
            let map = self.bucket(tenant).read();
            match map.get(&tenant) {
                Some(ctx) if ctx.io_class() == Some(io_class) => match ctx.try_ref() {
                    Some(found) => return found,
                    None => None,
                },
                Some(ctx) => Some(ctx.clone()),
                None => None,
            }
        };
        if let Some(stale) = stale {
            if self.unlink(&stale) {
                log::warn!(
                    "writeback: {} moved from {:?} to {}, unlinking context {}",
                    tenant,
                    stale.io_class(),
                    io_class,
                    stale.id()
                );
                stale.drop_index_ref();
            }
        }

        match self.create_context(tenant, io_class) {
            Ok(ctx) => ctx,
            Err(err) => {
                log::warn!(
                    "writeback: no context for {} on device {}: {}, using root",
                    tenant,
                    self.id,
                    err
                );
                self.root()
            },
        }
    }

    fn create_context(self: &Arc<Self>, tenant: TenantId, io_class: IoClassId) -> WbResult<ContextRef> {
        let mut displaced = None;
        let result = {
            let _barrier = self.barrier.read();
            self.insert_context(tenant, io_class, &mut displaced)
        };
        if let Some(old) = displaced {
            self.shared.tenants.remove(tenant, &old);
            old.drop_index_ref();
        }
        result
    }

    fn insert_context(
        self: &Arc<Self>,
        tenant: TenantId,
        io_class: IoClassId,
        displaced: &mut Option<Arc<WritebackContext>>,
    ) -> WbResult<ContextRef> {
        if !self.is_registered() {
            return Err(WbError::DeviceUnregistered);
        }
        let config = &self.shared.config;

        let ctx = {
            let mut map = self.bucket(tenant).write();
            if let Some(existing) = map.get(&tenant) {
                if existing.io_class() == Some(io_class) {
                    if let Some(found) = existing.try_ref() {
                        return Ok(found);
                    }
                }
                *displaced = map.remove(&tenant);
            }

            self.live_contexts
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < config.max_contexts_per_device).then_some(n + 1)
                })
                .map_err(|_| WbError::ContextLimitReached)?;
            if map.try_reserve(1).is_err() {
                self.live_contexts.fetch_sub(1, Ordering::AcqRel);
                return Err(WbError::AllocationFailed);
            }

            let ctx = WritebackContext::new(
                Some(TenantKey::new(tenant, io_class)),
                Arc::downgrade(self),
                config,
                &self.completions,
                self.shared.clock.now_ms(),
                true,
            );
            map.insert(tenant, ctx.clone());
            self.shared.tenants.insert(tenant, ctx.clone());
            ctx
        };
        self.all.lock().push(ctx.clone());

        log::debug!(
            "writeback: created context {} for {} ({}) on device {}",
            ctx.id(),
            tenant,
            io_class,
            self.id
        );
        Ok(ContextRef::adopt(ctx))
    }

    /// Remove `ctx` from the bucket and the tenant index.
    ///
    /// Returns whether either still held it.
    pub(crate) fn unlink(&self, ctx: &WritebackContext) -> bool {
        let Some(key) = ctx.tenant() else {
            return false;
        };
        let _barrier = self.barrier.read();
        let in_bucket = {
            let mut map = self.bucket(key.tenant).write();
            let held = map
                .get(&key.tenant)
                .is_some_and(|entry| core::ptr::eq(Arc::as_ptr(entry), ctx));
            if held {
                map.remove(&key.tenant);
            }
            held
        };
        let in_tenant = self.shared.tenants.remove(key.tenant, ctx);
        in_bucket || in_tenant
    }

    /// Drop a released context from the device
    pub(crate) fn forget(&self, ctx: &Arc<WritebackContext>) {
        let mut all = self.all.lock();
        if let Some(pos) = all.iter().position(|c| Arc::ptr_eq(c, ctx)) {
            all.swap_remove(pos);
            self.live_contexts.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Unlink every tenant context and drop the index references
    pub(crate) fn kill_tenant_contexts(&self) -> usize {
        let victims: Vec<_> = {
            let _barrier = self.barrier.write();
            self.buckets
                .iter()
                .flat_map(|bucket| {
                    let drained: Vec<_> = bucket.write().drain().map(|(_, ctx)| ctx).collect();
                    drained
                })
                .collect()
        };
        for ctx in &victims {
            if let Some(tenant) = ctx.tenant_id() {
                self.shared.tenants.remove(tenant, ctx);
            }
            ctx.drop_index_ref();
        }
        victims.len()
    }

    /// Tenant contexts not yet released
    pub fn context_count(&self) -> usize {
        self.live_contexts.load(Ordering::Acquire)
    }

    /// Handles to every live context, root first
    pub fn contexts(&self) -> Vec<ContextRef> {
        self.all.lock().iter().filter_map(|ctx| ctx.try_ref()).collect()
    }

    // -------------------------------------------------------------------------
    // Congestion & synchronization
    // -------------------------------------------------------------------------

    /// Set a congestion bit of the device
    pub fn set_congested(&self, channel: CongestionChannel) {
        self.root.set_congested(channel);
    }

    /// Clear a congestion bit of the device
    pub fn clear_congested(&self, channel: CongestionChannel) {
        self.root.clear_congested(channel);
    }

    pub fn congestion(&self) -> Congestion {
        self.root.congestion()
    }

    /// Queue a flush-everything item on every context.
    ///
    /// Holds the barrier exclusively while the contexts are collected and
    /// the items queued. Returns the number of items queued.
    pub fn sync_all(&self, done: Option<&Arc<Completion>>) -> WbResult<usize> {
        let mut targets = Vec::new();
        let barrier = self.barrier.write();
        targets.extend(self.contexts());
        let queued = targets.iter().try_fold(0, |queued, ctx| {
            let item = match done {
                Some(done) => WritebackWork::sync().with_completion(done.clone()),
                None => WritebackWork::sync(),
            };
            work::enqueue(ctx, item).map(|()| queued + 1)
        });
        // References must not be put with the barrier held.
        drop(barrier);
        drop(targets);
        queued
    }

    // -------------------------------------------------------------------------
    // Periodic work
    // -------------------------------------------------------------------------

    /// Decay shares, consolidate counters, sample bandwidth, refresh
    /// congestion and schedule contexts with expired data.
    pub fn tick(&self, now_ms: u64) {
        let config = &self.shared.config;
        self.completions.tick(now_ms);

        let snapshot: Vec<_> = self.all.lock().clone();
        for ctx in &snapshot {
            ctx.consolidate();
            ctx.update_bandwidth(self, now_ms);
            ctx.update_congestion(self);

            let due = {
                let io = ctx.io.lock();
                !io.queues.is_empty() && ctx.periodic_due(&io, config, now_ms)
            };
            if due && ctx.is_registered() {
                if let Some(ctx) = ctx.try_ref() {
                    work::wakeup(&ctx, self, 0);
                }
            }
        }
    }

    /// Snapshot of the device
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            id: self.id,
            capabilities: self.capabilities,
            registered: self.is_registered(),
            min_ratio: self.min_ratio(),
            max_ratio: self.max_ratio(),
            write_bandwidth: self.write_bandwidth(),
            contexts: self.context_count(),
            congestion: self.congestion(),
            completions: self.completions.events(),
            period: self.completions.period(),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("write_bandwidth", &self.write_bandwidth())
            .field("contexts", &self.context_count())
            .finish()
    }
}

/// Point-in-time view of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub id: u64,
    pub capabilities: Capabilities,
    pub registered: bool,
    pub min_ratio: u32,
    pub max_ratio: u32,
    pub write_bandwidth: u64,
    pub contexts: usize,
    pub congestion: Congestion,
    pub completions: u64,
    pub period: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirtyLimits, WritebackConfig};
    use crate::executor::RecordingScheduler;
    use crate::registry::DeviceRegistry;
    use crate::time::ManualClock;

    fn registry(config: WritebackConfig) -> (DeviceRegistry, Arc<RecordingScheduler>) {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(RecordingScheduler::new(clock.clone()));
        let registry = DeviceRegistry::new(config, clock, scheduler.clone()).unwrap();
        (registry, scheduler)
    }

    #[test]
    fn test_lookup_returns_same_context() {
        let (registry, _) = registry(WritebackConfig::default());
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let a = device.lookup_or_create(TenantId(1), IoClassId(1));
        let b = device.lookup_or_create(TenantId(1), IoClassId(1));
        assert!(ContextRef::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 3);
        assert_eq!(device.context_count(), 1);
        assert!(ContextRef::ptr_eq(&device.find(TenantId(1)).unwrap(), &a));
        assert!(device.find(TenantId(2)).is_none());
    }

    #[test]
    fn test_budget_exhaustion_falls_back_to_root() {
        let (registry, _) = registry(WritebackConfig::default().with_max_contexts(1));
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let a = device.lookup_or_create(TenantId(1), IoClassId(1));
        assert!(!a.is_root());
        let b = device.lookup_or_create(TenantId(2), IoClassId(1));
        assert!(b.is_root());
    }

    #[test]
    fn test_without_writeback_capability_uses_root() {
        let (registry, _) = registry(WritebackConfig::default());
        let device = registry
            .create(Capabilities::WRITEBACK_ACCT, 0, 100)
            .unwrap();
        assert!(device.lookup_or_create(TenantId(1), IoClassId(1)).is_root());
        assert_eq!(device.context_count(), 0);
    }

    #[test]
    fn test_thresholds_follow_share_and_ratios() {
        let config =
            WritebackConfig::default().with_dirty_limits(DirtyLimits::new(1000, 500));
        let (registry, _) = registry(config);
        let device = registry.create(Capabilities::WRITEBACK, 10, 60).unwrap();

        let empty = Share {
            numerator: 0,
            denominator: 0,
        };
        assert_eq!(device.context_thresholds(empty), (600, 300));
        let half = Share {
            numerator: 1,
            denominator: 2,
        };
        assert_eq!(device.context_thresholds(half), (500, 250));
        let none = Share {
            numerator: 0,
            denominator: 8,
        };
        assert_eq!(device.context_thresholds(none), (100, 50));
    }

    #[test]
    fn test_sync_all_reaches_every_context() {
        let (registry, scheduler) = registry(WritebackConfig::default());
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let a = device.lookup_or_create(TenantId(1), IoClassId(1));
        let b = device.lookup_or_create(TenantId(2), IoClassId(1));
        let done = Arc::new(device.new_completion());

        assert_eq!(device.sync_all(Some(&done)).unwrap(), 3);
        assert_eq!(done.pending(), 4);
        assert_eq!(a.work.lock().len(), 1);
        assert_eq!(b.work.lock().len(), 1);
        assert_eq!(scheduler.len(), 3);
        assert_eq!(a.refcount(), 3);
    }

    #[test]
    fn test_barrier_holds_off_creation_and_teardown() {
        use core::sync::atomic::AtomicBool;
        use std::thread;
        use std::time::Duration;

        let (registry, _) = registry(WritebackConfig::default());
        let registry = Arc::new(registry);
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        drop(device.lookup_or_create(TenantId(1), IoClassId(1)));

        let barrier = device.barrier.write();
        let created = Arc::new(AtomicBool::new(false));
        let creator = {
            let device = device.clone();
            let created = created.clone();
            thread::spawn(move || {
                let ctx = device.lookup_or_create(TenantId(2), IoClassId(1));
                created.store(true, Ordering::Release);
                ctx.id()
            })
        };
        let offline = {
            let registry = registry.clone();
            thread::spawn(move || registry.tenant_offline(TenantId(1)))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!created.load(Ordering::Acquire));
        assert_eq!(device.context_count(), 1);
        assert!(device.find(TenantId(1)).is_some());
        assert!(device.find(TenantId(2)).is_none());

        drop(barrier);
        let id = creator.join().unwrap();
        assert_eq!(offline.join().unwrap(), 1);
        assert_eq!(device.find(TenantId(2)).map(|ctx| ctx.id()), Some(id));
        assert!(device.find(TenantId(1)).is_none());
        assert_eq!(registry.run_release_work(), 1);
        assert_eq!(device.context_count(), 1);
    }

    #[test]
    fn test_lookup_races_tenant_offline() {
        use crate::context::ContextState;
        use core::sync::atomic::AtomicBool;
        use std::thread;

        let (registry, _) = registry(WritebackConfig::default());
        let registry = Arc::new(registry);
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        let tenant = TenantId(5);
        let stop = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let device = device.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let ctx = device.lookup_or_create(tenant, IoClassId(1));
                        assert!(!ctx.is_root());
                        assert_eq!(ctx.state(), ContextState::Active);
                        assert!(ctx.refcount() > 0);
                        if let Some(found) = device.find(tenant) {
                            assert_eq!(found.state(), ContextState::Active);
                            assert!(found.refcount() > 0);
                        }
                        drop(ctx);
                    }
                })
            })
            .collect();
        let reaper = {
            let registry = registry.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut unlinked = 0;
                while !stop.load(Ordering::Acquire) {
                    unlinked += registry.tenant_offline(tenant);
                    registry.run_release_work();
                    thread::yield_now();
                }
                unlinked
            })
        };

        for worker in workers {
            worker.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        reaper.join().unwrap();

        registry.tenant_offline(tenant);
        registry.run_release_work();
        assert!(device.find(tenant).is_none());
        assert_eq!(device.context_count(), 0);
        assert_eq!(registry.pending_releases(), 0);
    }

    #[test]
    fn test_device_congestion_word() {
        let (registry, _) = registry(WritebackConfig::default());
        let device = registry.create(Capabilities::WRITEBACK, 0, 100).unwrap();
        device.set_congested(CongestionChannel::Async);
        device.set_congested(CongestionChannel::Async);
        assert_eq!(device.congestion(), Congestion::ASYNC);
        device.clear_congested(CongestionChannel::Async);
        device.clear_congested(CongestionChannel::Async);
        assert!(device.congestion().is_empty());
    }
}
