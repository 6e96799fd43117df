//! # Helix OS Writeback Engine
//!
//! Per-device, per-tenant writeback throttling for buffered I/O. The engine
//! tracks what each backing device may flush, estimates the bandwidth it
//! sustains, keeps tenants from starving one another's flush backlog and
//! publishes completion and congestion signals that dirty-page producers use
//! for backpressure.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         HELIX WRITEBACK ENGINE                              │
//! │                                                                             │
//! │   producer ── lookup_or_create(tenant, class) ──▶ DeviceRegistry            │
//! │       │                                               │                     │
//! │       │                                               ▼                     │
//! │       │                                  ┌─────────────────────────┐        │
//! │       │                                  │ Device                  │        │
//! │       │                                  │  root ctx · index · Σbw │        │
//! │       │                                  └───────────┬─────────────┘        │
//! │       ▼                                              ▼                      │
//! │   enqueue(work, completion?) ─────────────▶ WritebackContext                │
//! │                                              queues · stats · bw · work     │
//! │                                                      │                      │
//! │              WorkScheduler (embedder) ◀── schedule ──┘                      │
//! │                      │                                                      │
//! │                      ▼                                                      │
//! │                  Executor ── write_inode ──▶ InodeWriter (embedder)         │
//! │                      │                                                      │
//! │                      ├──▶ statistics ──▶ proportion ──▶ bandwidth estimator │
//! │                      └──▶ Completion::done ──▶ WaitQueue::wake_all          │
//! │                                                                             │
//! │   ratelimit · congestion · dirty_exceeded ──────────────▶ producer          │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Embedding
//!
//! The crate is `no_std` and never blocks on anything but its own spin
//! locks and completions. The kernel supplies:
//!
//! | Trait              | Role                                         |
//! |--------------------|----------------------------------------------|
//! | [`Clock`]          | Monotonic milliseconds                       |
//! | [`WorkScheduler`]  | Deferred execution of [`Executor::run`]      |
//! | [`InodeWriter`]    | The I/O submission path                      |
//! | [`TenantClassifier`] | Current I/O class of a tenant (optional)   |
//!
//! and drives two background duties: [`DeviceRegistry::tick`] from a
//! periodic timer, and [`DeviceRegistry::run_release_work`] from a task
//! that may block.
//!
//! ## Invariants
//!
//! 1. **Uniqueness**: at most one live context per (device, tenant).
//! 2. **Aggregate**: a device's write bandwidth equals the sum of the
//!    smoothed bandwidth of its contexts flagged as having dirty I/O.
//! 3. **Lifecycle**: a context whose reference count reached zero is never
//!    returned by a lookup again; its release runs outside the caller that
//!    dropped the last reference.
//! 4. **Serialization**: a context never runs two executor passes at once.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Error types and the fault channel
pub mod error;

/// Engine configuration
pub mod config;

/// Time source
pub mod time;

/// Sharded statistics counters
pub mod counter;

/// Decaying proportional shares
pub mod proportion;

/// Completion and wait queue
pub mod completion;

/// Bandwidth estimator
pub mod bandwidth;

/// Dirty inode queues
pub mod queues;

/// Tenant identities
pub mod tenant;

/// Writeback contexts
pub mod context;

/// Work items
pub mod work;

/// Work executor
pub mod executor;

/// Deferred context release
pub mod release;

/// Backing devices
pub mod device;

/// Device registry
pub mod registry;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use completion::{wait_for_completion, Completion, WaitQueue};
pub use config::{CongestionThresholds, DirtyLimits, WritebackConfig};
pub use context::{
    Congestion, CongestionChannel, ContextFlags, ContextRef, ContextState, ContextStats,
    StatItem, WritebackContext,
};
pub use device::{Capabilities, Device, DeviceParams, DeviceStats};
pub use error::{report_fault, set_fault_handler, ErrorCategory, WbError, WbResult};
pub use executor::{
    DrainReport, Executor, InodeWriteResult, InodeWriter, RecordingScheduler, WorkScheduler,
    WriteStatus,
};
pub use queues::{DirtyInode, InodeId, QueueKind};
pub use registry::DeviceRegistry;
pub use tenant::{IoClassId, StaticClassifier, TenantClassifier, TenantId, TenantKey};
pub use time::{Clock, ManualClock};
pub use work::{enqueue, start_all, SyncMode, WritebackReason, WritebackWork};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static_assertions::assert_impl_all!(Device: Send, Sync);
static_assertions::assert_impl_all!(WritebackContext: Send, Sync);
static_assertions::assert_impl_all!(ContextRef: Send, Sync);
static_assertions::assert_impl_all!(Completion: Send, Sync);
static_assertions::assert_impl_all!(DeviceRegistry: Send, Sync);
