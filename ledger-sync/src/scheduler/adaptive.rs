//! Adaptive polling interval of the forward job.
//!
//! The interval slows down while runs bring in fewer items than the target, speeds up
//! proportionally when they bring more, and resets to [`RESET_INTERVAL`] after a burst.

use std::time::Duration;

use crate::config::{AdaptiveParams, MIN_INTERVAL, RESET_INTERVAL};

/// Computes the interval following a run that fetched `count` items.
///
/// The result is [`RESET_INTERVAL`] or lies within `[MIN_INTERVAL, params.max_interval]`.
pub fn next_interval(current: Duration, count: u64, params: &AdaptiveParams) -> Duration {
    if count > params.reset_threshold {
        return RESET_INTERVAL;
    }

    let base = current.max(MIN_INTERVAL).as_secs_f64();
    let factor = if count > 0 {
        params.target_items_per_run as f64 / count as f64
    } else {
        2.0
    };
    let max = params.max_interval.max(MIN_INTERVAL);

    let next = base * factor;
    if !next.is_finite() || next >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(next).clamp(MIN_INTERVAL, max)
}
