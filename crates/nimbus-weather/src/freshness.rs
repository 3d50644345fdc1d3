//! Freshness policy: pure age checks against the serve and retention thresholds.
//!
//! Age is `now - last_updated` in epoch millis. An entry is fresh while its age
//! is strictly below the serve threshold; at exactly the threshold it is stale.
//! It becomes evictable once its age reaches the retention threshold.
//! A negative age (entry written by a process with a clock ahead of ours) counts as zero.

use std::time::Duration;

/// Below this age cached data is shown without a network call.
pub const DEFAULT_SERVE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// At or above this age an entry may be evicted.
pub const DEFAULT_RETENTION_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Current wall-clock time in epoch millis.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn threshold_ms(threshold: Duration) -> i64 {
    i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX)
}

fn age_ms(last_updated_ms: i64, now_ms: i64) -> i64 {
    now_ms.saturating_sub(last_updated_ms).max(0)
}

/// True if data written at `last_updated_ms` can be served at `now_ms`.
pub fn is_fresh(last_updated_ms: i64, now_ms: i64, serve_threshold: Duration) -> bool {
    age_ms(last_updated_ms, now_ms) < threshold_ms(serve_threshold)
}

/// True if data written at `last_updated_ms` may be evicted at `now_ms`.
pub fn should_evict(last_updated_ms: i64, now_ms: i64, retention_threshold: Duration) -> bool {
    age_ms(last_updated_ms, now_ms) >= threshold_ms(retention_threshold)
}

/// Oldest `last_updated` still fresh at `now_ms`.
pub(crate) fn fresh_cutoff(now_ms: i64, serve_threshold: Duration) -> i64 {
    now_ms.saturating_sub(threshold_ms(serve_threshold))
}

/// Short "data age" label, e.g. "just now", "5m ago", "2h ago", "1d ago".
pub fn age_display(last_updated_ms: i64, now_ms: i64) -> String {
    let minutes = age_ms(last_updated_ms, now_ms) / 60_000;
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        format!("{}h ago", minutes / 60)
    } else {
        format!("{}d ago", minutes / 1440)
    }
}

/// The two thresholds, kept separate because they gate different decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub serve_threshold: Duration,
    pub retention_threshold: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            serve_threshold: DEFAULT_SERVE_THRESHOLD,
            retention_threshold: DEFAULT_RETENTION_THRESHOLD,
        }
    }
}

impl FreshnessPolicy {
    pub fn new(serve_threshold: Duration, retention_threshold: Duration) -> Self {
        Self {
            serve_threshold,
            retention_threshold,
        }
    }

    pub fn is_fresh(&self, last_updated_ms: i64, now_ms: i64) -> bool {
        is_fresh(last_updated_ms, now_ms, self.serve_threshold)
    }

    pub fn should_evict(&self, last_updated_ms: i64, now_ms: i64) -> bool {
        should_evict(last_updated_ms, now_ms, self.retention_threshold)
    }
}
