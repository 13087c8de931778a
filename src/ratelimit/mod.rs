//! Rate limiting logic and state management.

mod backend;
mod config;
mod decision;
mod key;
mod limiter;

pub use backend::AdmissionControl;
pub use config::{
    default_burst_threshold, BurstEvent, BurstHook, KeyFn, LimiterConfig, LimiterConfigBuilder,
    RefundPolicy, SkipFn, DEFAULT_BURST_WINDOW_MS, DEFAULT_MAX_PENALTY_MS, DEFAULT_MESSAGE,
    DEFAULT_PENALTY_MULTIPLIER, DEFAULT_STATUS_CODE, MAX_DURATION_MS,
};
pub use decision::{
    Allowance, Decision, PassReason, Rejection, RejectionBody, HEADER_LIMIT, HEADER_REMAINING,
    HEADER_RESET,
};
pub use key::{RateLimitKey, RequestInfo};
pub use limiter::Limiter;

pub(crate) use limiter::refund;
