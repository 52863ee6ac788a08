//! Per-key counter state and admission results.

use chrono::{DateTime, SecondsFormat, Utc};

/// Counter state for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Requests counted in the current window
    pub count: u32,
    /// When the current window ends, in epoch milliseconds
    pub reset_time: i64,
}

impl RateLimitEntry {
    /// Open a fresh window holding the request that created it.
    pub fn open(now: i64, window_ms: i64) -> Self {
        Self {
            count: 1,
            reset_time: now.saturating_add(window_ms),
        }
    }

    /// An entry is expired once its reset time has been reached.
    pub fn is_expired(&self, now: i64) -> bool {
        self.reset_time <= now
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Admissions left in the current window after this one
    pub remaining: u32,
    /// When the current window ends, in epoch milliseconds
    pub reset_time: i64,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, rounded up and never negative.
    pub fn retry_after_secs(&self, now: i64) -> u64 {
        let millis = (self.reset_time - now).max(0) as u64;
        millis.div_ceil(1000)
    }

    /// The reset time as an ISO-8601 UTC timestamp with millisecond precision.
    pub fn reset_time_iso(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.reset_time)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
