//! Persisted per-key counter state.

use serde::{Deserialize, Serialize};

/// Counter state for one rate limited key.
///
/// Timestamps are epoch milliseconds. The serialized form is a flat JSON
/// object: `{"count":3,"windowResetAt":…,"firstRequestAt":…,"penaltyUntil":…}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// When the current window ends
    pub window_reset_at: i64,
    /// When the current window started
    pub first_request_at: i64,
    /// Every request is rejected until this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_until: Option<i64>,
    /// Escalation step of the most recent penalty
    #[serde(default, skip_serializing_if = "is_zero")]
    pub violations: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl CounterRecord {
    /// Start a fresh window holding the first request.
    pub fn new(now: i64, window_ms: i64) -> Self {
        Self {
            count: 1,
            window_reset_at: now.saturating_add(window_ms),
            first_request_at: now,
            penalty_until: None,
            violations: 0,
        }
    }

    /// Open a new window, keeping penalty history.
    pub fn reset(&self, now: i64, window_ms: i64) -> Self {
        Self {
            penalty_until: self.penalty_until,
            violations: self.violations,
            ..Self::new(now, window_ms)
        }
    }

    /// The penalty deadline, if it is still in the future.
    pub fn active_penalty(&self, now: i64) -> Option<i64> {
        self.penalty_until.filter(|until| now < *until)
    }

    pub fn window_expired(&self, now: i64) -> bool {
        now > self.window_reset_at
    }

    /// Whether nothing about this record matters any more.
    pub fn is_stale(&self, now: i64) -> bool {
        self.window_expired(now) && self.active_penalty(now).is_none()
    }

    /// Latest instant at which this record still carries meaning.
    pub fn expires_at(&self) -> i64 {
        self.penalty_until
            .map_or(self.window_reset_at, |until| until.max(self.window_reset_at))
    }
}
