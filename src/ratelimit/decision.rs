//! Outcomes of a rate limit check and their wire shapes.

use serde::Serialize;

use super::config::RefundPolicy;

/// Total quota of the window.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Requests left in the window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Epoch milliseconds at which the window ends.
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Counted and admitted.
    Allow(Allowance),
    /// Rejected; the caller must wait.
    Deny(Rejection),
    /// Admitted without bookkeeping.
    Pass(PassReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Deny(_))
    }
}

/// Why a request went through without being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    /// The limiter's skip predicate matched.
    Skipped,
    /// Bookkeeping failed; rate limiting never blocks on its own errors.
    FailedOpen,
}

/// An admitted request that consumed a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    /// Counter key the slot was taken from
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window ends
    pub reset_at: i64,
    /// Handler outcomes that give the slot back
    pub refund: RefundPolicy,
}

impl Allowance {
    /// Informational response headers.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at.to_string()),
        ]
    }
}

/// A rejected request.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub key: String,
    pub status_code: u16,
    pub message: String,
    pub retry_after_seconds: u64,
    pub penalty_duration_seconds: u64,
    pub burst_detected: bool,
}

impl Rejection {
    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            success: false,
            error: self.message.clone(),
            retry_after_seconds: self.retry_after_seconds,
            rate_limit_exceeded: true,
            penalty_duration_seconds: self.penalty_duration_seconds,
            burst_detected: self.burst_detected.then_some(true),
        }
    }
}

/// JSON body sent with a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub error: String,
    pub retry_after_seconds: u64,
    pub rate_limit_exceeded: bool,
    pub penalty_duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst_detected: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection(burst: bool) -> Rejection {
        Rejection {
            key: "k".to_string(),
            status_code: 429,
            message: "slow down".to_string(),
            retry_after_seconds: 60,
            penalty_duration_seconds: 60,
            burst_detected: burst,
        }
    }

    #[test]
    fn test_rejection_body_shape() {
        let body = serde_json::to_value(rejection(false).body()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "error": "slow down",
                "retryAfterSeconds": 60,
                "rateLimitExceeded": true,
                "penaltyDurationSeconds": 60
            })
        );

        let body = serde_json::to_value(rejection(true).body()).unwrap();
        assert_eq!(body["burstDetected"], serde_json::json!(true));
    }

    #[test]
    fn test_allowance_headers() {
        let allowance = Allowance {
            key: "k".to_string(),
            limit: 3,
            remaining: 1,
            reset_at: 1_700_000_000_000,
            refund: RefundPolicy::default(),
        };
        let headers = allowance.headers();
        assert_eq!(headers[0], (HEADER_LIMIT, "3".to_string()));
        assert_eq!(headers[1], (HEADER_REMAINING, "1".to_string()));
        assert_eq!(headers[2], (HEADER_RESET, "1700000000000".to_string()));
    }

    #[test]
    fn test_pass_counts_as_allowed() {
        assert!(Decision::Pass(PassReason::FailedOpen).is_allowed());
        assert!(!Decision::Deny(rejection(false)).is_allowed());
    }
}
