//! Core rate limiter implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::backend::AdmissionControl;
use super::config::{BurstEvent, LimiterConfig, RefundPolicy};
use super::decision::{Allowance, Decision, PassReason, Rejection};
use super::key::RequestInfo;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{CounterRecord, Store};

/// Fixed-window rate limiter with burst detection and escalating penalties.
///
/// Counters live in a [`Store`]; the limiter itself holds no per-key state
/// and can be shared freely across tasks.
///
/// Each check is a read followed by a write against the store with no lock
/// in between, so concurrent requests for one key may both read the same
/// count and undercount by the overlap. For abuse protection that
/// approximation is acceptable.
pub struct Limiter {
    config: LimiterConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Limiter {
    /// Create a limiter, rejecting an unusable configuration up front.
    pub fn new(config: LimiterConfig, store: Arc<dyn Store>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: LimiterConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            clock,
        })
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Check and count a request.
    ///
    /// Never fails: internal errors are logged and the request is let
    /// through as [`PassReason::FailedOpen`].
    pub async fn check(&self, request: &RequestInfo) -> Decision {
        if let Some(skip) = &self.config.skip {
            if skip(request) {
                trace!(route = %request.route, "Request exempt from rate limiting");
                return Decision::Pass(PassReason::Skipped);
            }
        }

        let key = (self.config.key_fn)(request);
        match self.evaluate(&key).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
                Decision::Pass(PassReason::FailedOpen)
            }
        }
    }

    /// Current counter for the request's key, if any.
    pub async fn counter(&self, request: &RequestInfo) -> Result<Option<CounterRecord>> {
        let key = (self.config.key_fn)(request);
        Ok(self.store.get(&key).await?)
    }

    /// Forget everything about the request's key, including penalties.
    pub async fn reset(&self, request: &RequestInfo) -> Result<()> {
        let key = (self.config.key_fn)(request);
        debug!(key = %key, "Clearing rate limit state");
        Ok(self.store.delete(&key).await?)
    }

    /// Give back the slot taken by `allowance` if the handler's `status`
    /// falls into a refunded class. The adjustment runs on a spawned task.
    pub fn on_response_complete(&self, allowance: &Allowance, status: u16) -> Option<JoinHandle<()>> {
        refund(self.store.clone(), allowance, status)
    }

    async fn evaluate(&self, key: &str) -> Result<Decision> {
        let now = self.clock.now_ms();
        let config = &self.config;

        trace!(key = %key, "Checking rate limit");

        let Some(mut record) = self.store.get(key).await? else {
            let record = CounterRecord::new(now, config.window_ms);
            debug!(key = %key, reset_at = record.window_reset_at, "Creating rate limit counter");
            self.store.set(key, &record).await?;
            return Ok(Decision::Allow(self.allowance(key, &record)));
        };

        if let Some(until) = record.active_penalty(now) {
            let remaining = ceil_secs(until - now);
            debug!(key = %key, retry_after = remaining, "Request rejected during penalty");
            return Ok(Decision::Deny(self.rejection(key, remaining, remaining, false)));
        }

        if record.window_expired(now) {
            let record = record.reset(now, config.window_ms);
            debug!(key = %key, reset_at = record.window_reset_at, "Rate limit window reset");
            self.store.set(key, &record).await?;
            return Ok(Decision::Allow(self.allowance(key, &record)));
        }

        let elapsed = now - record.first_request_at;
        let burst = elapsed < config.burst_window_ms && record.count >= config.burst_threshold;
        if burst && record.count == config.burst_threshold {
            (config.on_burst)(&BurstEvent {
                key: key.to_string(),
                count: record.count,
                elapsed_ms: elapsed,
            });
        }

        if record.count >= config.max_requests {
            let violations = if record.penalty_until.is_some() {
                record.violations.saturating_add(1)
            } else {
                1
            };
            let penalty_ms = self.penalty_ms(violations);
            record.penalty_until = Some(now.saturating_add(penalty_ms));
            record.violations = violations;
            self.store.set(key, &record).await?;

            let penalty_secs = ceil_secs(penalty_ms);
            warn!(
                key = %key,
                count = record.count,
                limit = config.max_requests,
                violations = violations,
                penalty_secs = penalty_secs,
                burst = burst,
                "Rate limit exceeded"
            );
            return Ok(Decision::Deny(self.rejection(key, penalty_secs, penalty_secs, burst)));
        }

        record.count += 1;
        self.store.set(key, &record).await?;
        Ok(Decision::Allow(self.allowance(key, &record)))
    }

    /// Length of the `violations`-th consecutive penalty.
    fn penalty_ms(&self, violations: u32) -> i64 {
        let exponent = i32::try_from(violations.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.config.window_ms as f64 * self.config.penalty_multiplier.powi(exponent);
        scaled.min(self.config.max_penalty_ms as f64) as i64
    }

    fn allowance(&self, key: &str, record: &CounterRecord) -> Allowance {
        Allowance {
            key: key.to_string(),
            limit: self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(record.count),
            reset_at: record.window_reset_at,
            refund: RefundPolicy::from(&self.config),
        }
    }

    fn rejection(&self, key: &str, retry_after: u64, penalty: u64, burst: bool) -> Rejection {
        Rejection {
            key: key.to_string(),
            status_code: self.config.status_code,
            message: self.config.message.clone(),
            retry_after_seconds: retry_after,
            penalty_duration_seconds: penalty,
            burst_detected: burst,
        }
    }
}

#[async_trait]
impl AdmissionControl for Limiter {
    async fn check(&self, request: &RequestInfo) -> Decision {
        Limiter::check(self, request).await
    }

    fn on_response_complete(&self, allowance: &Allowance, status: u16) -> Option<JoinHandle<()>> {
        Limiter::on_response_complete(self, allowance, status)
    }
}

/// Milliseconds to whole seconds, rounded up.
fn ceil_secs(ms: i64) -> u64 {
    u64::try_from(ms.saturating_add(999).div_euclid(1000)).unwrap_or(0)
}

/// Undo the increment behind `allowance` when `status` is refunded.
///
/// Only the window the slot was taken from is adjusted; once the window has
/// been reset the refund is dropped.
pub(crate) fn refund(
    store: Arc<dyn Store>,
    allowance: &Allowance,
    status: u16,
) -> Option<JoinHandle<()>> {
    if !allowance.refund.applies_to(status) {
        return None;
    }

    let key = allowance.key.clone();
    let reset_at = allowance.reset_at;
    Some(tokio::spawn(async move {
        let adjusted = async {
            match store.get(&key).await? {
                Some(mut record) if record.window_reset_at == reset_at => {
                    record.count = record.count.saturating_sub(1);
                    store.set(&key, &record).await?;
                    Ok(true)
                }
                _ => Ok::<_, crate::store::StoreError>(false),
            }
        };

        match adjusted.await {
            Ok(true) => trace!(key = %key, status = status, "Refunded rate limit slot"),
            Ok(false) => trace!(key = %key, "Window already reset, refund dropped"),
            Err(e) => warn!(key = %key, error = %e, "Failed to refund rate limit slot"),
        }
    }))
}
