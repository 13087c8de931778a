//! Per-limiter policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::key::{RateLimitKey, RequestInfo};
use crate::error::{Result, WardenError};

/// Default burst observation window.
pub const DEFAULT_BURST_WINDOW_MS: i64 = 10_000;
/// Default growth factor between consecutive penalties.
pub const DEFAULT_PENALTY_MULTIPLIER: f64 = 2.0;
/// Default ceiling on a single penalty (one hour).
pub const DEFAULT_MAX_PENALTY_MS: i64 = 3_600_000;
/// Longest window, burst window or penalty a limiter accepts (365 days).
pub const MAX_DURATION_MS: i64 = 365 * 24 * 60 * 60 * 1000;
/// Default rejection status (429 Too Many Requests).
pub const DEFAULT_STATUS_CODE: u16 = 429;
/// Default rejection message.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Derives the counter key from a request.
pub type KeyFn = Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>;
/// Returns `true` for requests that bypass rate limiting entirely.
pub type SkipFn = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;
/// Observes burst episodes. Never affects the decision.
pub type BurstHook = Arc<dyn Fn(&BurstEvent) + Send + Sync>;

/// A caller crossed the burst threshold early in its window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstEvent {
    pub key: String,
    pub count: u64,
    /// Milliseconds since the window opened
    pub elapsed_ms: i64,
}

/// Declarative rate limit policy, fixed for the lifetime of a limiter.
#[derive(Clone)]
pub struct LimiterConfig {
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Count at which a burst is flagged
    pub burst_threshold: u64,
    /// A burst must happen this soon after the window opens
    pub burst_window_ms: i64,
    /// Growth factor between consecutive penalties
    pub penalty_multiplier: f64,
    /// Ceiling on a single penalty
    pub max_penalty_ms: i64,
    /// Refund the slot when the handler answers 2xx/3xx
    pub skip_successful: bool,
    /// Refund the slot when the handler answers 4xx/5xx
    pub skip_failed: bool,
    /// HTTP status of a rejection
    pub status_code: u16,
    /// Error message of a rejection
    pub message: String,
    pub key_fn: KeyFn,
    pub skip: Option<SkipFn>,
    pub on_burst: BurstHook,
}

impl LimiterConfig {
    /// Start building a policy admitting `max_requests` per `window`.
    pub fn builder(window: Duration, max_requests: u64) -> LimiterConfigBuilder {
        LimiterConfigBuilder::new(window, max_requests)
    }

    /// Reject values that could never produce a working limiter.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(WardenError::InvalidConfiguration(msg));

        if self.window_ms <= 0 || self.window_ms > MAX_DURATION_MS {
            return invalid(format!(
                "window must be positive and at most {}ms, got {}ms",
                MAX_DURATION_MS, self.window_ms
            ));
        }
        if self.max_requests == 0 {
            return invalid("max_requests must be greater than 0".to_string());
        }
        if self.burst_threshold == 0 {
            return invalid("burst_threshold must be greater than 0".to_string());
        }
        if self.burst_window_ms <= 0 || self.burst_window_ms > MAX_DURATION_MS {
            return invalid(format!(
                "burst window must be positive and at most {}ms, got {}ms",
                MAX_DURATION_MS, self.burst_window_ms
            ));
        }
        if !self.penalty_multiplier.is_finite() || self.penalty_multiplier < 1.0 {
            return invalid(format!(
                "penalty_multiplier must be at least 1, got {}",
                self.penalty_multiplier
            ));
        }
        if self.max_penalty_ms <= 0 || self.max_penalty_ms > MAX_DURATION_MS {
            return invalid(format!(
                "max penalty must be positive and at most {}ms, got {}ms",
                MAX_DURATION_MS, self.max_penalty_ms
            ));
        }
        if !(400..=599).contains(&self.status_code) {
            return invalid(format!(
                "status_code must be a 4xx or 5xx code, got {}",
                self.status_code
            ));
        }
        Ok(())
    }

    /// Whether a handler response with `status` gives its slot back.
    pub fn refunds(&self, status: u16) -> bool {
        RefundPolicy::from(self).applies_to(status)
    }
}

impl fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("burst_threshold", &self.burst_threshold)
            .field("burst_window_ms", &self.burst_window_ms)
            .field("penalty_multiplier", &self.penalty_multiplier)
            .field("max_penalty_ms", &self.max_penalty_ms)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .field("status_code", &self.status_code)
            .field("message", &self.message)
            .field("skip", &self.skip.is_some())
            .finish_non_exhaustive()
    }
}

/// Which handler outcomes give a counted slot back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefundPolicy {
    pub successful: bool,
    pub failed: bool,
}

impl RefundPolicy {
    pub fn applies_to(&self, status: u16) -> bool {
        match status {
            200..=399 => self.successful,
            400..=599 => self.failed,
            _ => false,
        }
    }
}

impl From<&LimiterConfig> for RefundPolicy {
    fn from(config: &LimiterConfig) -> Self {
        Self {
            successful: config.skip_successful,
            failed: config.skip_failed,
        }
    }
}

/// Default burst threshold: 60% of the window's quota, at least one.
pub fn default_burst_threshold(max_requests: u64) -> u64 {
    (max_requests.saturating_mul(6) / 10).max(1)
}

fn default_key_fn() -> KeyFn {
    Arc::new(|request: &RequestInfo| RateLimitKey::from_request(request).to_string())
}

fn log_burst() -> BurstHook {
    Arc::new(|event: &BurstEvent| {
        warn!(
            key = %event.key,
            count = event.count,
            elapsed_ms = event.elapsed_ms,
            "Burst detected"
        );
    })
}

/// Builder for [`LimiterConfig`]; `build` validates.
pub struct LimiterConfigBuilder {
    config: LimiterConfig,
    burst_threshold: Option<u64>,
}

impl LimiterConfigBuilder {
    fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            config: LimiterConfig {
                window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
                max_requests,
                burst_threshold: default_burst_threshold(max_requests),
                burst_window_ms: DEFAULT_BURST_WINDOW_MS,
                penalty_multiplier: DEFAULT_PENALTY_MULTIPLIER,
                max_penalty_ms: DEFAULT_MAX_PENALTY_MS,
                skip_successful: false,
                skip_failed: false,
                status_code: DEFAULT_STATUS_CODE,
                message: DEFAULT_MESSAGE.to_string(),
                key_fn: default_key_fn(),
                skip: None,
                on_burst: log_burst(),
            },
            burst_threshold: None,
        }
    }

    pub fn burst_threshold(mut self, threshold: u64) -> Self {
        self.burst_threshold = Some(threshold);
        self
    }

    pub fn burst_window(mut self, window: Duration) -> Self {
        self.config.burst_window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn penalty_multiplier(mut self, multiplier: f64) -> Self {
        self.config.penalty_multiplier = multiplier;
        self
    }

    pub fn max_penalty(mut self, max: Duration) -> Self {
        self.config.max_penalty_ms = i64::try_from(max.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.config.skip_successful = skip;
        self
    }

    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.config.skip_failed = skip;
        self
    }

    pub fn status_code(mut self, status: u16) -> Self {
        self.config.status_code = status;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.config.message = message.into();
        self
    }

    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        self.config.key_fn = Arc::new(key_fn);
        self
    }

    pub fn skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.config.skip = Some(Arc::new(skip));
        self
    }

    pub fn on_burst<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BurstEvent) + Send + Sync + 'static,
    {
        self.config.on_burst = Arc::new(hook);
        self
    }

    pub fn build(mut self) -> Result<LimiterConfig> {
        if let Some(threshold) = self.burst_threshold {
            self.config.burst_threshold = threshold;
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
