//! Admission control trait for abstracting single and tiered limiters.

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::decision::{Allowance, Decision};
use super::key::RequestInfo;

/// Trait for admission control implementations.
///
/// This trait abstracts over a single [`Limiter`](super::Limiter) and the
/// [`TieredLimiter`](crate::tier::TieredLimiter) so the HTTP adapter can
/// work with either.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Decide whether a request may proceed.
    async fn check(&self, request: &RequestInfo) -> Decision;

    /// Report the handler's status for an admitted request.
    ///
    /// Any counter adjustment runs in the background; the returned handle may
    /// be dropped.
    fn on_response_complete(&self, allowance: &Allowance, status: u16) -> Option<JoinHandle<()>>;
}
