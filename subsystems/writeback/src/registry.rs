//! # Device Registry
//!
//! Owns every registered device and the state shared by all of them: the
//! configuration, the embedder's clock and scheduler, the global dirty
//! limits, the tenant reverse index and the release queue.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         DEVICE REGISTRY                              │
//! │                                                                      │
//! │  devices: BTreeMap<id, Arc<Device>>        (sorted for enumeration)  │
//! │                                                                      │
//! │  shared ──▶ config · clock · scheduler · dirty limits                │
//! │             tenants: TenantId ──▶ [contexts on every device]         │
//! │             releases: dying contexts awaiting teardown               │
//! │                                                                      │
//! │  tick() ──▶ Device::tick ──▶ decay · consolidate · sample · congest  │
//! │  run_release_work() ──▶ release dying contexts                       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is an owned value. Creating it starts the engine and
//! dropping it after every device was unregistered ends it; there is no
//! ambient global state.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use crate::config::{DirtyLimits, WritebackConfig};
use crate::context::{ContextFlags, ContextRef};
use crate::device::{Capabilities, Device, DeviceParams};
use crate::error::{WbError, WbResult};
use crate::executor::WorkScheduler;
use crate::release::{ReleaseNotifier, ReleaseQueue};
use crate::tenant::{IoClassId, TenantClassifier, TenantId, TenantIndex};
use crate::time::Clock;

/// I/O class used when no classifier is installed
pub const DEFAULT_IO_CLASS: IoClassId = IoClassId(0);

/// State shared by the registry and all of its devices
pub struct RegistryShared {
    pub(crate) config: WritebackConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: Arc<dyn WorkScheduler>,
    pub(crate) limits: RwLock<DirtyLimits>,
    pub(crate) tenants: TenantIndex,
    pub(crate) releases: ReleaseQueue,
}

impl fmt::Debug for RegistryShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryShared")
            .field("limits", &*self.limits.read())
            .field("tenants", &self.tenants)
            .field("releases", &self.releases)
            .finish_non_exhaustive()
    }
}

/// Registry of backing devices
pub struct DeviceRegistry {
    shared: Arc<RegistryShared>,
    devices: RwLock<BTreeMap<u64, Arc<Device>>>,
    next_id: AtomicU64,
    min_ratio_total: Mutex<u32>,
    classifier: Option<Arc<dyn TenantClassifier>>,
}

impl DeviceRegistry {
    /// Create a registry
    pub fn new(
        config: WritebackConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn WorkScheduler>,
    ) -> WbResult<Self> {
        config.validate()?;
        let limits = config.dirty_limits;
        Ok(Self {
            shared: Arc::new(RegistryShared {
                config,
                clock,
                scheduler,
                limits: RwLock::new(limits),
                tenants: TenantIndex::new(),
                releases: ReleaseQueue::new(),
            }),
            devices: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            min_ratio_total: Mutex::new(0),
            classifier: None,
        })
    }

    /// Attach the tenant classification service
    pub fn with_classifier(mut self, classifier: Arc<dyn TenantClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &WritebackConfig {
        &self.shared.config
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Register a device with the given capabilities and share ratios
    pub fn create(
        &self,
        capabilities: Capabilities,
        min_ratio: u32,
        max_ratio: u32,
    ) -> WbResult<Arc<Device>> {
        self.create_with(
            DeviceParams::new("")
                .with_capabilities(capabilities)
                .with_ratios(min_ratio, max_ratio),
        )
    }

    /// Register a device
    pub fn create_with(&self, mut params: DeviceParams) -> WbResult<Arc<Device>> {
        params.validate()?;
        let mut total = self.min_ratio_total.lock();
        if *total + params.min_ratio > 100 {
            return Err(WbError::InvalidArgument);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if params.name.is_empty() {
            params.name = alloc::format!("bdi{}", id);
        }
        let min_ratio = params.min_ratio;
        let device = Device::new(id, params, self.shared.clone());
        self.devices.write().insert(id, device.clone());
        *total += min_ratio;

        log::debug!(
            "writeback: registered device {} ({}) caps={:?}",
            id,
            device.name(),
            device.capabilities()
        );
        Ok(device)
    }

    /// Device by id
    pub fn get(&self, id: u64) -> Option<Arc<Device>> {
        self.devices.read().get(&id).cloned()
    }

    /// Every registered device, by id
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    /// Unregister `device`.
    ///
    /// Tenant contexts are unlinked and their releases run. Fails with
    /// [`WbError::Busy`] while some of them are still referenced; the
    /// device then stays closed to new contexts and the call may be
    /// retried.
    pub fn unregister(&self, device: &Arc<Device>) -> WbResult<()> {
        if !self.devices.read().contains_key(&device.id()) {
            return Err(WbError::NotFound);
        }
        device.set_registered(false);
        device.kill_tenant_contexts();
        self.run_release_work();
        if device.context_count() > 0 {
            log::warn!(
                "writeback: device {} still has {} contexts",
                device.id(),
                device.context_count()
            );
            return Err(WbError::Busy);
        }

        let root = device.root();
        let leftovers: Vec<_> = {
            let mut work = root.work.lock();
            root.test_and_clear(ContextFlags::REGISTERED);
            work.drain(..).collect()
        };
        for item in leftovers {
            item.finish();
        }

        if self.devices.write().remove(&device.id()).is_some() {
            let mut total = self.min_ratio_total.lock();
            *total = total.saturating_sub(device.min_ratio());
        }
        log::debug!("writeback: unregistered device {}", device.id());
        Ok(())
    }

    /// Set the guaranteed share of `device`
    pub fn set_min_ratio(&self, device: &Device, ratio: u32) -> WbResult<()> {
        if ratio > device.max_ratio() {
            return Err(WbError::InvalidArgument);
        }
        let mut total = self.min_ratio_total.lock();
        let new_total = total.saturating_sub(device.min_ratio()) + ratio;
        if new_total > 100 {
            return Err(WbError::InvalidArgument);
        }
        *total = new_total;
        device.store_min_ratio(ratio);
        Ok(())
    }

    /// Set the maximum share of `device`
    pub fn set_max_ratio(&self, device: &Device, ratio: u32) -> WbResult<()> {
        let _total = self.min_ratio_total.lock();
        if ratio > 100 || ratio < device.min_ratio() {
            return Err(WbError::InvalidArgument);
        }
        device.store_max_ratio(ratio);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Contexts
    // -------------------------------------------------------------------------

    /// Context of `(tenant, io_class)` on `device`, created on first use
    pub fn lookup_or_create_context(
        &self,
        device: &Arc<Device>,
        tenant: TenantId,
        io_class: IoClassId,
    ) -> ContextRef {
        device.lookup_or_create(tenant, io_class)
    }

    /// Context of `tenant` on `device` under its current I/O class.
    ///
    /// Tenants the classifier no longer knows use the root context.
    pub fn context_for_tenant(&self, device: &Arc<Device>, tenant: TenantId) -> ContextRef {
        let io_class = match &self.classifier {
            Some(classifier) => classifier.current_io_class(tenant),
            None => Some(DEFAULT_IO_CLASS),
        };
        match io_class {
            Some(io_class) => device.lookup_or_create(tenant, io_class),
            None => device.root(),
        }
    }

    /// Live contexts of `tenant` on every device
    pub fn tenant_contexts(&self, tenant: TenantId) -> Vec<ContextRef> {
        self.shared
            .tenants
            .contexts(tenant)
            .iter()
            .filter_map(|ctx| ctx.try_ref())
            .collect()
    }

    /// Unlink every context of `tenant`. Returns how many were unlinked.
    pub fn tenant_offline(&self, tenant: TenantId) -> usize {
        let contexts = self.shared.tenants.take(tenant);
        for ctx in &contexts {
            if let Ok(device) = ctx.device() {
                device.unlink(ctx);
            }
            ctx.drop_index_ref();
        }
        if !contexts.is_empty() {
            log::debug!("writeback: {} offline, {} contexts unlinked", tenant, contexts.len());
        }
        contexts.len()
    }

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------

    pub fn dirty_limits(&self) -> DirtyLimits {
        *self.shared.limits.read()
    }

    /// Install new global dirty limits
    pub fn set_dirty_limits(&self, limits: DirtyLimits) -> WbResult<()> {
        limits.validate()?;
        *self.shared.limits.write() = limits;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Background work
    // -------------------------------------------------------------------------

    /// Periodic maintenance of every device; returns the tick time
    pub fn tick(&self) -> u64 {
        let now = self.shared.clock.now_ms();
        for device in self.devices() {
            device.tick(now);
        }
        now
    }

    /// Release every context queued for release
    pub fn run_release_work(&self) -> usize {
        self.shared.releases.run()
    }

    pub fn pending_releases(&self) -> usize {
        self.shared.releases.len()
    }

    /// Hook run whenever a context is queued for release
    pub fn set_release_notifier(&self, notifier: Option<ReleaseNotifier>) {
        self.shared.releases.set_notifier(notifier);
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.read().len())
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}
