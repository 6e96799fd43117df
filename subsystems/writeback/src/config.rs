//! # Writeback Configuration
//!
//! Tunables for the bandwidth estimator, the proportional share tracker and
//! the work executor, plus the externally supplied dirty and congestion
//! thresholds.
//!
//! None of the figures below are load-bearing beyond their shape: the
//! estimator samples periodically, smooths over a bounded window and the
//! share tracker decays monotonically. Embedders are expected to override
//! them to match their clock resolution and device class.

use static_assertions::const_assert;

use crate::error::{WbError, WbResult};

// =============================================================================
// DEFAULTS
// =============================================================================

/// Minimum spacing between two bandwidth samples of a context
pub const DEFAULT_BANDWIDTH_INTERVAL_MS: u64 = 200;

/// Window over which a bandwidth sample is blended into the average
pub const DEFAULT_SMOOTHING_WINDOW_MS: u64 = 1000;

/// Dirty ratelimit of a fresh context, in pages per second (100 MiB/s of 4 KiB pages)
pub const DEFAULT_INIT_RATELIMIT: u64 = 25_600;

/// Lowest ratelimit the control loop may settle on
pub const DEFAULT_RATELIMIT_FLOOR: u64 = 1;

/// `dirty_ratelimit` moves by at most `1 / 2^shift` of the gap per update
pub const DEFAULT_RATELIMIT_STEP_SHIFT: u32 = 3;

/// Period after which completion history is halved
pub const DEFAULT_PROP_PERIOD_MS: u64 = 3000;

/// Device completion totals are kept below `2^shift`
pub const DEFAULT_PROP_PRECISION_SHIFT: u32 = 20;

/// Shards per distributed counter
pub const DEFAULT_COUNTER_SHARDS: usize = 8;

/// Shard value at which a counter folds into its central total
pub const DEFAULT_COUNTER_BATCH: i64 = 32;

/// Periodic (old data) flush interval
pub const DEFAULT_WRITEBACK_INTERVAL_MS: u64 = 5_000;

/// Age after which dirty data is written by the periodic flush
pub const DEFAULT_DIRTY_EXPIRE_MS: u64 = 30_000;

/// Age after which timestamp-only dirty inodes are written
pub const DEFAULT_DIRTYTIME_EXPIRE_MS: u64 = 12 * 60 * 60 * 1000;

/// Tenant contexts a single device may hold
pub const DEFAULT_MAX_CONTEXTS_PER_DEVICE: usize = 4096;

/// Longest pause handed to a dirtying producer
pub const DEFAULT_MAX_PAUSE_MS: u64 = 200;

/// Upper bound on shards per counter
pub const MAX_COUNTER_SHARDS: usize = 64;

const_assert!(DEFAULT_BANDWIDTH_INTERVAL_MS < DEFAULT_SMOOTHING_WINDOW_MS);
const_assert!(DEFAULT_COUNTER_SHARDS <= MAX_COUNTER_SHARDS);
const_assert!(DEFAULT_RATELIMIT_FLOOR <= DEFAULT_INIT_RATELIMIT);

// =============================================================================
// THRESHOLDS
// =============================================================================

/// Global dirty page thresholds supplied by the page cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyLimits {
    /// Dirty pages at which producers are throttled hard
    pub thresh_pages: u64,
    /// Dirty pages at which background writeback starts
    pub bg_thresh_pages: u64,
}

impl DirtyLimits {
    /// Create limits
    pub const fn new(thresh_pages: u64, bg_thresh_pages: u64) -> Self {
        Self {
            thresh_pages,
            bg_thresh_pages,
        }
    }

    /// Validate the pair
    pub fn validate(&self) -> WbResult<()> {
        if self.thresh_pages == 0 || self.bg_thresh_pages > self.thresh_pages {
            return Err(WbError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for DirtyLimits {
    fn default() -> Self {
        // 20% / 10% of a 4 GiB machine
        Self::new(209_715, 104_857)
    }
}

/// Backlog thresholds for the congestion flags of a device's contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionThresholds {
    /// Dirty backlog (pages) that raises the async flag
    pub async_pages: u64,
    /// In-flight writeback (pages) that raises the sync flag
    pub sync_pages: u64,
}

impl CongestionThresholds {
    /// Create thresholds
    pub const fn new(async_pages: u64, sync_pages: u64) -> Self {
        Self {
            async_pages,
            sync_pages,
        }
    }
}

impl Default for CongestionThresholds {
    fn default() -> Self {
        Self::new(32_768, 8_192)
    }
}

// =============================================================================
// ENGINE CONFIGURATION
// =============================================================================

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct WritebackConfig {
    /// Minimum interval between bandwidth samples
    pub bandwidth_interval_ms: u64,
    /// Smoothing window; gaps at least this long reset the average
    pub smoothing_window_ms: u64,
    /// Initial dirty ratelimit (pages/s)
    pub init_ratelimit: u64,
    /// Ratelimit floor (pages/s)
    pub ratelimit_floor: u64,
    /// Ratelimit rate-of-change shift
    pub ratelimit_step_shift: u32,
    /// Completion history halving period
    pub prop_period_ms: u64,
    /// Completion total precision
    pub prop_precision_shift: u32,
    /// Shards per distributed counter
    pub counter_shards: usize,
    /// Fold batch of distributed counters
    pub counter_batch: i64,
    /// Periodic flush interval
    pub writeback_interval_ms: u64,
    /// Dirty data expiry
    pub dirty_expire_ms: u64,
    /// Timestamp-only dirty inode expiry
    pub dirtytime_expire_ms: u64,
    /// Maximum tenant contexts per device
    pub max_contexts_per_device: usize,
    /// Maximum producer pause
    pub max_pause_ms: u64,
    /// Initial global dirty limits
    pub dirty_limits: DirtyLimits,
    /// Initial congestion thresholds of new devices
    pub congestion: CongestionThresholds,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            bandwidth_interval_ms: DEFAULT_BANDWIDTH_INTERVAL_MS,
            smoothing_window_ms: DEFAULT_SMOOTHING_WINDOW_MS,
            init_ratelimit: DEFAULT_INIT_RATELIMIT,
            ratelimit_floor: DEFAULT_RATELIMIT_FLOOR,
            ratelimit_step_shift: DEFAULT_RATELIMIT_STEP_SHIFT,
            prop_period_ms: DEFAULT_PROP_PERIOD_MS,
            prop_precision_shift: DEFAULT_PROP_PRECISION_SHIFT,
            counter_shards: DEFAULT_COUNTER_SHARDS,
            counter_batch: DEFAULT_COUNTER_BATCH,
            writeback_interval_ms: DEFAULT_WRITEBACK_INTERVAL_MS,
            dirty_expire_ms: DEFAULT_DIRTY_EXPIRE_MS,
            dirtytime_expire_ms: DEFAULT_DIRTYTIME_EXPIRE_MS,
            max_contexts_per_device: DEFAULT_MAX_CONTEXTS_PER_DEVICE,
            max_pause_ms: DEFAULT_MAX_PAUSE_MS,
            dirty_limits: DirtyLimits::default(),
            congestion: CongestionThresholds::default(),
        }
    }
}

impl WritebackConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bandwidth sampling interval and smoothing window
    pub fn with_bandwidth_timing(mut self, interval_ms: u64, window_ms: u64) -> Self {
        self.bandwidth_interval_ms = interval_ms;
        self.smoothing_window_ms = window_ms;
        self
    }

    /// Set initial ratelimit and floor
    pub fn with_ratelimit(mut self, init: u64, floor: u64) -> Self {
        self.init_ratelimit = init;
        self.ratelimit_floor = floor;
        self
    }

    /// Set ratelimit step shift
    pub fn with_ratelimit_step_shift(mut self, shift: u32) -> Self {
        self.ratelimit_step_shift = shift;
        self
    }

    /// Set proportion decay period and precision
    pub fn with_proportion(mut self, period_ms: u64, precision_shift: u32) -> Self {
        self.prop_period_ms = period_ms;
        self.prop_precision_shift = precision_shift;
        self
    }

    /// Set distributed counter geometry
    pub fn with_counters(mut self, shards: usize, batch: i64) -> Self {
        self.counter_shards = shards;
        self.counter_batch = batch;
        self
    }

    /// Set periodic flush timing
    pub fn with_periodic_flush(mut self, interval_ms: u64, expire_ms: u64) -> Self {
        self.writeback_interval_ms = interval_ms;
        self.dirty_expire_ms = expire_ms;
        self
    }

    /// Set the per-device context budget
    pub fn with_max_contexts(mut self, max: usize) -> Self {
        self.max_contexts_per_device = max;
        self
    }

    /// Set the initial global dirty limits
    pub fn with_dirty_limits(mut self, limits: DirtyLimits) -> Self {
        self.dirty_limits = limits;
        self
    }

    /// Set the default congestion thresholds
    pub fn with_congestion(mut self, congestion: CongestionThresholds) -> Self {
        self.congestion = congestion;
        self
    }

    /// Check that every tunable is usable
    pub fn validate(&self) -> WbResult<()> {
        if self.bandwidth_interval_ms == 0
            || self.smoothing_window_ms <= self.bandwidth_interval_ms
        {
            return Err(WbError::InvalidArgument);
        }
        if self.ratelimit_floor == 0 || self.init_ratelimit < self.ratelimit_floor {
            return Err(WbError::InvalidArgument);
        }
        if !(1..=16).contains(&self.ratelimit_step_shift) {
            return Err(WbError::InvalidArgument);
        }
        if self.prop_period_ms == 0 || !(8..=40).contains(&self.prop_precision_shift) {
            return Err(WbError::InvalidArgument);
        }
        if self.counter_shards == 0
            || self.counter_shards > MAX_COUNTER_SHARDS
            || self.counter_batch <= 0
        {
            return Err(WbError::InvalidArgument);
        }
        if self.writeback_interval_ms == 0 || self.max_contexts_per_device == 0 {
            return Err(WbError::InvalidArgument);
        }
        self.dirty_limits.validate()
    }
}
