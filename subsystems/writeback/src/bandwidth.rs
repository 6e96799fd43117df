//! # Bandwidth Estimation & Dirty Ratelimit
//!
//! Per-context control loop, run at most once per sampling interval whenever
//! the executor makes progress and from the periodic tick.
//!
//! ```text
//!   written/dirtied counters ──▶ deltas over dt
//!                                   │
//!            ┌──────────────────────┼──────────────────────┐
//!            ▼                      ▼                      ▼
//!     write_bandwidth         dirty_rate            pos_ratio(dirty vs
//!     (instantaneous)              │                 share-scaled thresh)
//!            │                     │                      │
//!            ▼                     └──────────┬───────────┘
//!     avg_write_bandwidth ───────────────────▶│
//!     (blended by dt / window)                ▼
//!                                 balanced_dirty_ratelimit
//!                                             │ bounded step
//!                                             ▼
//!                                      dirty_ratelimit
//! ```
//!
//! All rates are pages per second. The position ratio is fixed point with
//! `POS_RATIO_SCALE` as `1.0`.

use crate::config::WritebackConfig;
use crate::time::{elapsed_ms, MSEC_PER_SEC};

/// Fixed-point shift of the position ratio
pub const POS_RATIO_SHIFT: u32 = 10;

/// `1.0` in position ratio fixed point
pub const POS_RATIO_SCALE: u64 = 1 << POS_RATIO_SHIFT;

/// Lowest position ratio outside strict limiting
const POS_RATIO_MIN: u64 = POS_RATIO_SCALE / 4;

/// Highest position ratio
const POS_RATIO_MAX: u64 = 2 * POS_RATIO_SCALE;

/// Ratelimit ceiling, far above any real device
const RATELIMIT_CEILING: u64 = 1 << 40;

/// Inputs of one estimator run
#[derive(Debug, Clone, Copy)]
pub struct BandwidthSample {
    /// Sample time
    pub now_ms: u64,
    /// Pages written so far
    pub written: u64,
    /// Pages dirtied so far
    pub dirtied: u64,
    /// Pages currently dirty in the context
    pub dirty_pages: u64,
    /// Context hard threshold
    pub thresh: u64,
    /// Context background threshold
    pub bg_thresh: u64,
    /// Strict limiting enabled on the device
    pub strict: bool,
}

/// Outcome of an estimator run that took a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthUpdate {
    /// Average before the sample
    pub old_avg: u64,
    /// Average after the sample
    pub new_avg: u64,
    /// Dirty pages exceed the context threshold
    pub dirty_exceeded: bool,
}

/// Bandwidth and ratelimit state of a context
#[derive(Debug, Clone)]
pub struct BandwidthState {
    /// Time of the last sample
    pub last_sample_ms: u64,
    /// Dirtied counter at the last sample
    pub dirtied_snapshot: u64,
    /// Written counter at the last sample
    pub written_snapshot: u64,
    /// Instantaneous write bandwidth of the last sample
    pub write_bandwidth: u64,
    /// Smoothed write bandwidth
    pub avg_write_bandwidth: u64,
    /// Dirtying rate of the last sample
    pub dirty_rate: u64,
    /// Enforced ratelimit
    pub dirty_ratelimit: u64,
    /// Ratelimit the control loop is steering towards
    pub balanced_dirty_ratelimit: u64,
    /// Last position ratio
    pub pos_ratio: u64,
    /// Samples taken
    pub samples: u64,
}

impl BandwidthState {
    /// Fresh state sampled at `now_ms`
    pub fn new(now_ms: u64, config: &WritebackConfig) -> Self {
        Self {
            last_sample_ms: now_ms,
            dirtied_snapshot: 0,
            written_snapshot: 0,
            write_bandwidth: 0,
            avg_write_bandwidth: 0,
            dirty_rate: 0,
            dirty_ratelimit: config.init_ratelimit,
            balanced_dirty_ratelimit: config.init_ratelimit,
            pos_ratio: POS_RATIO_SCALE,
            samples: 0,
        }
    }

    /// Zero every estimate and restart sampling at `now_ms`
    pub fn reset(&mut self, now_ms: u64, config: &WritebackConfig) {
        *self = Self::new(now_ms, config);
    }

    /// Run the estimator. Returns `None` when the interval has not elapsed.
    pub fn update(
        &mut self,
        sample: &BandwidthSample,
        config: &WritebackConfig,
    ) -> Option<BandwidthUpdate> {
        let dt = elapsed_ms(sample.now_ms, self.last_sample_ms);
        if dt < config.bandwidth_interval_ms {
            return None;
        }

        let written = sample.written.saturating_sub(self.written_snapshot);
        let dirtied = sample.dirtied.saturating_sub(self.dirtied_snapshot);

        let old_avg = self.avg_write_bandwidth;
        self.write_bandwidth = per_second(written, dt);
        self.avg_write_bandwidth = smooth(
            old_avg,
            self.write_bandwidth,
            dt,
            config.smoothing_window_ms,
        );
        self.dirty_rate = per_second(dirtied, dt);
        self.update_ratelimit(sample, config);

        self.last_sample_ms = sample.now_ms;
        self.written_snapshot = sample.written;
        self.dirtied_snapshot = sample.dirtied;
        self.samples += 1;

        #[cfg(feature = "trace-bandwidth")]
        log::trace!(
            "bw sample dt={}ms bw={} avg={} dirty_rate={} pos={} ratelimit={}/{}",
            dt,
            self.write_bandwidth,
            self.avg_write_bandwidth,
            self.dirty_rate,
            self.pos_ratio,
            self.dirty_ratelimit,
            self.balanced_dirty_ratelimit
        );

        Some(BandwidthUpdate {
            old_avg,
            new_avg: self.avg_write_bandwidth,
            dirty_exceeded: sample.dirty_pages > sample.thresh,
        })
    }

    fn update_ratelimit(&mut self, sample: &BandwidthSample, config: &WritebackConfig) {
        self.pos_ratio = pos_ratio(
            sample.dirty_pages,
            sample.bg_thresh,
            sample.thresh,
            sample.strict,
        );

        let task_ratelimit =
            ((self.dirty_ratelimit as u128 * self.pos_ratio as u128) >> POS_RATIO_SHIFT) as u64;
        let balanced = if self.dirty_rate == 0 {
            task_ratelimit
        } else {
            (task_ratelimit as u128 * self.avg_write_bandwidth as u128 / self.dirty_rate as u128)
                as u64
        };
        self.balanced_dirty_ratelimit = balanced.clamp(config.ratelimit_floor, RATELIMIT_CEILING);

        self.dirty_ratelimit = step_towards(
            self.dirty_ratelimit,
            self.balanced_dirty_ratelimit,
            config.ratelimit_step_shift,
        )
        .max(config.ratelimit_floor);
    }
}

/// `pages` over `dt_ms`, in pages per second
#[inline]
pub fn per_second(pages: u64, dt_ms: u64) -> u64 {
    if dt_ms == 0 {
        return 0;
    }
    (pages as u128 * MSEC_PER_SEC as u128 / dt_ms as u128) as u64
}

/// Blend `sample` into `avg` with weight `dt / window`.
///
/// A gap of a full window or more means the history is stale; the sample
/// replaces the average outright.
pub fn smooth(avg: u64, sample: u64, dt_ms: u64, window_ms: u64) -> u64 {
    if dt_ms >= window_ms {
        return sample;
    }
    let kept = window_ms - dt_ms;
    ((avg as u128 * kept as u128 + sample as u128 * dt_ms as u128) / window_ms as u128) as u64
}

/// Position of `dirty` between the background and hard thresholds.
///
/// Cubic around the midpoint setpoint: `1.0` at the setpoint, above `1.0`
/// below it and falling towards the hard threshold. Strict limiting lets it
/// reach zero at the hard threshold; otherwise it bottoms out at a quarter.
pub fn pos_ratio(dirty: u64, bg_thresh: u64, thresh: u64, strict: bool) -> u64 {
    let floor = if strict { 0 } else { POS_RATIO_MIN };
    if thresh == 0 {
        return if dirty == 0 { POS_RATIO_SCALE } else { floor };
    }
    if dirty >= thresh {
        return floor;
    }

    let freerun = bg_thresh.min(thresh);
    let setpoint = (freerun + thresh) / 2;
    let span = (thresh - setpoint).max(1) as i128;
    let scale = POS_RATIO_SCALE as i128;

    let x = ((setpoint as i128 - dirty as i128) * scale / span).clamp(-scale, scale);
    let ratio = scale + x * x * x / (scale * scale);
    (ratio.max(0) as u64).clamp(floor, POS_RATIO_MAX)
}

/// Move `current` towards `target` by `1 / 2^shift` of the gap, at least one.
pub fn step_towards(current: u64, target: u64, shift: u32) -> u64 {
    if current == target {
        return current;
    }
    let gap = current.abs_diff(target);
    let step = (gap >> shift).max(1);
    if target > current {
        current + step
    } else {
        current - step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WritebackConfig {
        WritebackConfig::default()
    }

    fn sample(now_ms: u64, written: u64) -> BandwidthSample {
        BandwidthSample {
            now_ms,
            written,
            dirtied: written,
            dirty_pages: 0,
            thresh: 10_000,
            bg_thresh: 5_000,
            strict: false,
        }
    }

    #[test]
    fn test_skip_below_interval() {
        let config = config();
        let mut bw = BandwidthState::new(0, &config);
        assert!(bw.update(&sample(100, 500), &config).is_none());
        assert_eq!(bw.samples, 0);
        assert_eq!(bw.written_snapshot, 0);
    }

    #[test]
    fn test_first_window_from_zero() {
        let config = config();
        let mut bw = BandwidthState::new(0, &config);
        let update = bw.update(&sample(200, 1000), &config).unwrap();
        assert_eq!(bw.write_bandwidth, 5000);
        assert_eq!(update.old_avg, 0);
        assert_eq!(update.new_avg, 1000);
        assert_eq!(bw.last_sample_ms, 200);
        assert_eq!(bw.written_snapshot, 1000);
    }

    #[test]
    fn test_converges_to_constant_rate() {
        let config = config();
        let mut bw = BandwidthState::new(0, &config);
        let rate = 4000;
        let mut written = 0;
        for step in 1..=60 {
            written += rate * 200 / 1000;
            bw.update(&sample(step * 200, written), &config);
        }
        assert!(bw.avg_write_bandwidth.abs_diff(rate) <= rate / 100);
    }

    #[test]
    fn test_stop_decays_geometrically() {
        let config = config();
        let mut bw = BandwidthState::new(0, &config);
        let mut written = 0;
        let mut now = 0;
        for _ in 0..60 {
            now += 200;
            written += 800;
            bw.update(&sample(now, written), &config);
        }
        let steady = bw.avg_write_bandwidth;

        now += 200;
        bw.update(&sample(now, written), &config);
        let first = bw.avg_write_bandwidth;
        assert!(first > 0 && first < steady);
        assert_eq!(first, steady * 4 / 5);

        for _ in 0..4 {
            now += 200;
            bw.update(&sample(now, written), &config);
        }
        assert!(bw.avg_write_bandwidth > 0);
        assert!(bw.avg_write_bandwidth < first / 2);
    }

    #[test]
    fn test_idle_gap_resets_average() {
        let config = config();
        let mut bw = BandwidthState::new(0, &config);
        bw.avg_write_bandwidth = 9000;
        bw.update(&sample(5000, 1000), &config);
        assert_eq!(bw.avg_write_bandwidth, 200);
    }

    #[test]
    fn test_pos_ratio_shape() {
        assert_eq!(pos_ratio(7500, 5000, 10_000, false), POS_RATIO_SCALE);
        assert!(pos_ratio(6000, 5000, 10_000, false) > POS_RATIO_SCALE);
        assert!(pos_ratio(9000, 5000, 10_000, false) < POS_RATIO_SCALE);
        assert_eq!(pos_ratio(12_000, 5000, 10_000, false), POS_RATIO_MIN);
        assert_eq!(pos_ratio(12_000, 5000, 10_000, true), 0);
        assert_eq!(pos_ratio(0, 5000, 10_000, false), 2 * POS_RATIO_SCALE);
    }

    #[test]
    fn test_ratelimit_moves_in_bounded_steps() {
        let config = config();
        let mut bw = BandwidthState::new(0, &config);
        let start = bw.dirty_ratelimit;
        let mut s = sample(200, 100);
        s.dirty_pages = 20_000;
        s.dirtied = 10_000;
        bw.update(&s, &config);

        assert!(bw.balanced_dirty_ratelimit < start);
        let gap = start - bw.balanced_dirty_ratelimit;
        assert_eq!(start - bw.dirty_ratelimit, (gap >> config.ratelimit_step_shift).max(1));
        assert!(bw.update(&s, &config).is_none());
    }

    #[test]
    fn test_step_towards_never_overshoots() {
        assert_eq!(step_towards(100, 100, 3), 100);
        assert_eq!(step_towards(100, 101, 3), 101);
        assert_eq!(step_towards(100, 180, 3), 110);
        assert_eq!(step_towards(100, 20, 3), 90);
    }
}
