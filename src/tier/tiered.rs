//! Admission control that picks a limiter by caller tier.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, trace};

use super::presets::Tier;
use super::resolver::TierResolver;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::{refund, AdmissionControl, Allowance, Decision, Limiter, RequestInfo};
use crate::store::Store;

/// One pre-built [`Limiter`] per tier over a shared store.
///
/// Every tier's policy is validated when the limiter is constructed, so a
/// bad preset fails startup instead of the first request from that tier.
pub struct TieredLimiter {
    resolver: Arc<TierResolver>,
    store: Arc<dyn Store>,
    free: Limiter,
    premium: Limiter,
    admin: Limiter,
}

impl TieredLimiter {
    pub fn new(resolver: Arc<TierResolver>, store: Arc<dyn Store>) -> Result<Self> {
        Self::with_clock(resolver, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        resolver: Arc<TierResolver>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let build = |tier: Tier| -> Result<Limiter> {
            let config = resolver.config_for(tier)?;
            info!(
                environment = %resolver.environment(),
                tier = %tier,
                window_ms = config.window_ms,
                max_requests = config.max_requests,
                "Configured tier limiter"
            );
            Limiter::with_clock(config, store.clone(), clock.clone())
        };

        Ok(Self {
            free: build(Tier::Free)?,
            premium: build(Tier::Premium)?,
            admin: build(Tier::Admin)?,
            resolver,
            store,
        })
    }

    pub fn resolver(&self) -> &Arc<TierResolver> {
        &self.resolver
    }

    pub fn limiter(&self, tier: Tier) -> &Limiter {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
            Tier::Admin => &self.admin,
        }
    }

    /// Resolve the caller's tier and check against that tier's limiter.
    pub async fn check(&self, request: &RequestInfo) -> Decision {
        let tier = self.resolver.resolve_tier(request).await;
        trace!(tier = %tier, route = %request.route, "Dispatching to tier limiter");

        let mut request = request.clone();
        request.tier = Some(tier.as_str().to_string());
        self.limiter(tier).check(&request).await
    }
}

#[async_trait]
impl AdmissionControl for TieredLimiter {
    async fn check(&self, request: &RequestInfo) -> Decision {
        TieredLimiter::check(self, request).await
    }

    fn on_response_complete(&self, allowance: &Allowance, status: u16) -> Option<JoinHandle<()>> {
        refund(self.store.clone(), allowance, status)
    }
}
