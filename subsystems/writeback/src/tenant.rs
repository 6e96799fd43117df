//! Tenant identities and the tenant reverse index.
//!
//! The engine does not classify tenants itself. It consumes an opaque
//! tenant id and the I/O class the tenant is currently mapped to; the
//! mapping is owned by an external [`TenantClassifier`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::RwLock;

use crate::context::WritebackContext;

/// Isolation domain identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(pub u64);

/// I/O class a tenant is mapped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoClassId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tenant:{}", self.0)
    }
}

impl fmt::Display for IoClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ioclass:{}", self.0)
    }
}

/// Key of a tenant context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TenantKey {
    pub tenant: TenantId,
    pub io_class: IoClassId,
}

impl TenantKey {
    pub const fn new(tenant: TenantId, io_class: IoClassId) -> Self {
        Self { tenant, io_class }
    }
}

/// External tenant classification service
pub trait TenantClassifier: Send + Sync {
    /// Current I/O class of `tenant`, `None` once the tenant is gone
    fn current_io_class(&self, tenant: TenantId) -> Option<IoClassId>;
}

/// Table-driven classifier for embedders without a controller and for tests
#[derive(Debug, Default)]
pub struct StaticClassifier {
    classes: RwLock<BTreeMap<TenantId, IoClassId>>,
}

impl StaticClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `tenant` to `io_class`, returning the previous mapping
    pub fn assign(&self, tenant: TenantId, io_class: IoClassId) -> Option<IoClassId> {
        self.classes.write().insert(tenant, io_class)
    }

    /// Forget `tenant`
    pub fn remove(&self, tenant: TenantId) -> Option<IoClassId> {
        self.classes.write().remove(&tenant)
    }
}

impl TenantClassifier for StaticClassifier {
    fn current_io_class(&self, tenant: TenantId) -> Option<IoClassId> {
        self.classes.read().get(&tenant).copied()
    }
}

// =============================================================================
// REVERSE INDEX
// =============================================================================

/// Contexts of every tenant across all devices
#[derive(Default)]
pub(crate) struct TenantIndex {
    map: RwLock<BTreeMap<TenantId, Vec<Arc<WritebackContext>>>>,
}

impl TenantIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, tenant: TenantId, ctx: Arc<WritebackContext>) {
        self.map.write().entry(tenant).or_default().push(ctx);
    }

    /// Unlink `ctx`; returns whether it was linked
    pub(crate) fn remove(&self, tenant: TenantId, ctx: &WritebackContext) -> bool {
        let mut map = self.map.write();
        let Some(list) = map.get_mut(&tenant) else {
            return false;
        };
        let before = list.len();
        list.retain(|c| !core::ptr::eq(Arc::as_ptr(c), ctx));
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(&tenant);
        }
        removed
    }

    /// Unlink and return every context of `tenant`
    pub(crate) fn take(&self, tenant: TenantId) -> Vec<Arc<WritebackContext>> {
        self.map.write().remove(&tenant).unwrap_or_default()
    }

    pub(crate) fn contexts(&self, tenant: TenantId) -> Vec<Arc<WritebackContext>> {
        self.map.read().get(&tenant).cloned().unwrap_or_default()
    }

    pub(crate) fn tenants(&self) -> usize {
        self.map.read().len()
    }
}

impl fmt::Debug for TenantIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantIndex")
            .field("tenants", &self.tenants())
            .finish()
    }
}
