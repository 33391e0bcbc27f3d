//! Tuning parameters of the sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Interval used by the forward job right after a burst of new items.
pub const RESET_INTERVAL: Duration = Duration::from_millis(10);

/// Lower bound of every adaptive interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Aggregated configuration of every engine component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub coordinator: CoordinatorConfig,
    pub coverage: CoverageConfig,
}

/// Cursor job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Items requested per history page.
    pub page_limit: usize,
    /// Fixed forward interval. Adaptive when `None`.
    pub forward_interval: Option<Duration>,
    /// Interval between backward runs.
    pub backward_interval: Duration,
    /// Wait of a backward job deferring to the forward job's first run.
    pub defer_delay: Duration,
    /// Wait after a failed run.
    pub error_delay: Duration,
    /// Jobs not run for this many of their own intervals are reported stalled.
    pub stall_factor: u64,
    pub adaptive: AdaptiveParams,
    pub page_retry: PageRetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            page_limit: 100,
            forward_interval: None,
            backward_interval: Duration::from_secs(2),
            defer_delay: Duration::from_secs(1),
            error_delay: Duration::from_secs(5),
            stall_factor: 5,
            adaptive: AdaptiveParams::default(),
            page_retry: PageRetryPolicy::default(),
        }
    }
}

/// Parameters of the forward job's adaptive interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveParams {
    /// Items per run the interval is tuned toward.
    pub target_items_per_run: u64,
    /// Above this many items the interval resets to [`RESET_INTERVAL`].
    pub reset_threshold: u64,
    pub max_interval: Duration,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            target_items_per_run: 80,
            reset_threshold: 500,
            max_interval: Duration::from_secs(60),
        }
    }
}

/// Retry budget for short or failed history pages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRetryPolicy {
    pub max_page_retries: u32,
    /// Pages shorter than this are fetched again while a `before` cursor is present.
    pub min_page_items: usize,
    /// Linear backoff step between attempts.
    pub retry_delay: Duration,
}

impl Default for PageRetryPolicy {
    fn default() -> Self {
        Self {
            max_page_retries: 3,
            min_page_items: 10,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Durable work queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub chunk_size: usize,
    /// Chunks handled at once.
    pub concurrency: usize,
    /// Wait when the queue is empty. `add_work` cuts it short.
    pub idle_delay: Duration,
    pub error_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            concurrency: 4,
            idle_delay: Duration::from_secs(1),
            error_delay: Duration::from_secs(5),
        }
    }
}

/// Range request coordinator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Completion sweeps triggered within this window run once.
    pub sweep_debounce: Duration,
    pub retry_interval: Duration,
    /// Open requests younger than this are left to the normal delivery path.
    pub retry_after: Duration,
    pub refetch_batch_size: usize,
    /// Slots read per step of a response stream.
    pub response_page_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_debounce: Duration::from_millis(50),
            retry_interval: Duration::from_secs(600),
            retry_after: Duration::from_secs(600),
            refetch_batch_size: 100,
            response_page_size: 100,
        }
    }
}

/// Coverage tracker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Longest range dispatched in one request.
    pub chunk_timeframe: Duration,
    pub fetch_interval: Duration,
    pub processor_idle: Duration,
    pub compaction_interval: Duration,
    pub error_delay: Duration,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            chunk_timeframe: Duration::from_secs(24 * 60 * 60),
            fetch_interval: Duration::from_secs(5),
            processor_idle: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(300),
            error_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"queue": {"chunk_size": 7}}"#).unwrap();
        assert_eq!(config.queue.chunk_size, 7);
        assert_eq!(config.queue.concurrency, QueueConfig::default().concurrency);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }
}
