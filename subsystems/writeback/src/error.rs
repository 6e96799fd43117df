//! # Error Handling
//!
//! Error types for the writeback engine and the fault channel used to report
//! internal invariant violations to the embedding kernel.
//!
//! Most engine operations are infallible by construction: context lookup
//! degrades to the root context instead of failing, and stale tenant
//! associations are repaired silently. What remains falls into four groups:
//!
//! | Category  | Codes   | Recoverable | Example                              |
//! |-----------|---------|-------------|--------------------------------------|
//! | General   | 0-99    | Yes         | Ratio out of range                   |
//! | Resource  | 100-199 | Yes         | Per-device context budget exhausted  |
//! | Lifecycle | 200-299 | Yes         | Device unregistered during creation  |
//! | Invariant | 300-399 | No          | Context without an owning device     |
//!
//! Invariant violations are never returned silently. They are routed through
//! [`report_fault`], which logs them, counts them and hands them to the
//! handler installed with [`set_fault_handler`].

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

/// Result type for writeback operations
pub type WbResult<T> = Result<T, WbError>;

// =============================================================================
// ERROR KIND
// =============================================================================

/// Writeback engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WbError {
    // -------------------------------------------------------------------------
    // General Errors (0-99)
    // -------------------------------------------------------------------------
    /// Invalid argument provided
    InvalidArgument     = 1,

    /// Object is in the wrong state for the operation
    InvalidState        = 2,

    /// Object not found
    NotFound            = 3,

    /// Object still in use
    Busy                = 4,

    // -------------------------------------------------------------------------
    // Resource Errors (100-199)
    // -------------------------------------------------------------------------
    /// Memory for a new context could not be reserved
    AllocationFailed    = 100,

    /// The device reached its context budget
    ContextLimitReached = 101,

    // -------------------------------------------------------------------------
    // Lifecycle Errors (200-299)
    // -------------------------------------------------------------------------
    /// Context is transitioning to release
    ContextDying        = 200,

    /// Context resources were already released
    ContextReleased     = 201,

    /// Device was unregistered
    DeviceUnregistered  = 202,

    // -------------------------------------------------------------------------
    // Invariant Violations (300-399)
    // -------------------------------------------------------------------------
    /// Context has no owning device link
    OrphanContext       = 300,

    /// Reference or completion count dropped below zero
    RefcountUnderflow   = 301,
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input or state
    General,
    /// Resource exhaustion
    Resource,
    /// Object lifecycle races
    Lifecycle,
    /// Broken internal invariant
    Invariant,
}

impl WbError {
    /// Numeric error code
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Category of this error
    pub const fn category(self) -> ErrorCategory {
        match self.code() {
            0..=99 => ErrorCategory::General,
            100..=199 => ErrorCategory::Resource,
            200..=299 => ErrorCategory::Lifecycle,
            _ => ErrorCategory::Invariant,
        }
    }

    /// Whether the error signals a broken invariant rather than a runtime condition
    pub const fn is_fatal(self) -> bool {
        matches!(self.category(), ErrorCategory::Invariant)
    }

    /// Short human readable description
    pub const fn description(self) -> &'static str {
        match self {
            WbError::InvalidArgument => "invalid argument",
            WbError::InvalidState => "invalid state",
            WbError::NotFound => "not found",
            WbError::Busy => "resource busy",
            WbError::AllocationFailed => "context allocation failed",
            WbError::ContextLimitReached => "device context budget exhausted",
            WbError::ContextDying => "context is dying",
            WbError::ContextReleased => "context already released",
            WbError::DeviceUnregistered => "device unregistered",
            WbError::OrphanContext => "context has no owning device",
            WbError::RefcountUnderflow => "reference count underflow",
        }
    }
}

impl fmt::Display for WbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description(), self.code())
    }
}

// =============================================================================
// FAULT CHANNEL
// =============================================================================

/// Handler invoked for every reported invariant violation
pub type FaultHandler = fn(WbError, &'static str);

static FAULT_HANDLER: Once<FaultHandler> = Once::new();
static FAULT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Install the embedder's fault handler.
///
/// Only the first call takes effect; returns `false` if a handler was
/// already installed.
pub fn set_fault_handler(handler: FaultHandler) -> bool {
    let mut installed = false;
    FAULT_HANDLER.call_once(|| {
        installed = true;
        handler
    });
    installed
}

/// Number of faults reported since boot
pub fn fault_count() -> u64 {
    FAULT_COUNT.load(Ordering::Relaxed)
}

/// Report an invariant violation and hand the error back for propagation.
pub fn report_fault(err: WbError, site: &'static str) -> WbError {
    FAULT_COUNT.fetch_add(1, Ordering::Relaxed);
    log::error!("writeback fault at {}: {}", site, err);
    if let Some(handler) = FAULT_HANDLER.get() {
        handler(err, site);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(WbError::InvalidArgument.category(), ErrorCategory::General);
        assert_eq!(WbError::AllocationFailed.category(), ErrorCategory::Resource);
        assert_eq!(WbError::ContextDying.category(), ErrorCategory::Lifecycle);
        assert_eq!(WbError::OrphanContext.category(), ErrorCategory::Invariant);
        assert!(WbError::RefcountUnderflow.is_fatal());
        assert!(!WbError::Busy.is_fatal());
    }

    #[test]
    fn test_report_fault_counts() {
        let before = fault_count();
        let err = report_fault(WbError::OrphanContext, "test");
        assert_eq!(err, WbError::OrphanContext);
        assert!(fault_count() > before);
    }
}
