//! Tier resolution and per-tier limiter policies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::presets::{Environment, PresetTable, Tier};
use crate::config::LimitsConfig;
use crate::error::{Result, WardenError};
use crate::ratelimit::{LimiterConfig, RateLimitKey, RequestInfo};

/// Entries kept before stale lookups are pruned.
const CACHE_PRUNE_THRESHOLD: usize = 10_000;

/// Account lookup failure.
#[derive(Debug, Error)]
#[error("Account lookup failed: {0}")]
pub struct DirectoryError(pub String);

/// Source of truth for a caller's membership tier.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// The raw tier label stored for `subject`, or `None` for unknown
    /// accounts.
    async fn tier_of(&self, subject: &str) -> std::result::Result<Option<String>, DirectoryError>;
}

#[derive(Debug, Clone, Copy)]
struct CachedTier {
    tier: Tier,
    fetched_at: Instant,
}

/// Maps callers to tiers and tiers to limiter policies.
///
/// Precedence: a tier attached upstream on the request, then the account
/// directory for authenticated subjects, then [`Tier::Free`]. Directory
/// answers are cached per subject; failed lookups are not.
pub struct TierResolver {
    environment: Environment,
    presets: PresetTable,
    limits: LimitsConfig,
    directory: Option<Arc<dyn AccountDirectory>>,
    cache: DashMap<String, CachedTier>,
    cache_ttl: Duration,
}

impl TierResolver {
    pub fn new(presets: PresetTable, limits: LimitsConfig) -> Self {
        Self {
            environment: limits.environment,
            cache_ttl: limits.tier_cache_ttl(),
            presets,
            limits,
            directory: None,
            cache: DashMap::new(),
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn AccountDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn presets(&self) -> &PresetTable {
        &self.presets
    }

    /// Classify the caller behind `request`.
    pub async fn resolve_tier(&self, request: &RequestInfo) -> Tier {
        if let Some(label) = &request.tier {
            return Tier::parse(label);
        }

        let (Some(subject), Some(directory)) = (&request.subject, &self.directory) else {
            return Tier::Free;
        };

        if let Some(cached) = self.cache.get(subject) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return cached.tier;
            }
        }

        match directory.tier_of(subject).await {
            Ok(label) => {
                let tier = label.as_deref().map(Tier::parse).unwrap_or(Tier::Free);
                debug!(subject = %subject, tier = %tier, "Resolved account tier");
                self.remember(subject, tier);
                tier
            }
            Err(e) => {
                warn!(subject = %subject, error = %e, "Tier lookup failed, treating caller as free");
                Tier::Free
            }
        }
    }

    /// Drop a cached lookup, e.g. after an upgrade.
    pub fn invalidate(&self, subject: &str) {
        self.cache.remove(subject);
    }

    /// Limiter policy for `tier` in the configured environment.
    pub fn config_for(&self, tier: Tier) -> Result<LimiterConfig> {
        let policy = self.presets.policy(self.environment, tier);
        self.limits
            .limiter_builder(Duration::from_secs(policy.window_secs), policy.max_requests)
            .build()
    }

    /// Limiter policy for a named route group such as `auth`.
    pub fn route_config(&self, name: &str) -> Result<LimiterConfig> {
        let route = self.presets.route(name).ok_or_else(|| {
            WardenError::InvalidConfiguration(format!("no route preset named {}", name))
        })?;

        let mut builder = self
            .limits
            .limiter_builder(Duration::from_secs(route.window_secs), route.max_requests);
        if let Some(status) = route.status_code {
            builder = builder.status_code(status);
        }
        if let Some(message) = &route.message {
            builder = builder.message(message.clone());
        }
        let route_name = name.to_string();
        builder
            .key_fn(move |request| format!("{}:{}", route_name, RateLimitKey::from_request(request)))
            .build()
    }

    fn remember(&self, subject: &str, tier: Tier) {
        if self.cache.len() >= CACHE_PRUNE_THRESHOLD {
            let ttl = self.cache_ttl;
            self.cache.retain(|_, cached| cached.fetched_at.elapsed() < ttl);
        }
        self.cache.insert(
            subject.to_string(),
            CachedTier {
                tier,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Directory backed by a map, counting lookups.
    #[derive(Default)]
    pub(crate) struct StaticDirectory {
        pub tiers: Mutex<HashMap<String, String>>,
        pub lookups: AtomicUsize,
        pub failing: AtomicBool,
    }

    impl StaticDirectory {
        pub fn with(entries: &[(&str, &str)]) -> Self {
            let directory = Self::default();
            for (subject, tier) in entries {
                directory
                    .tiers
                    .lock()
                    .insert(subject.to_string(), tier.to_string());
            }
            directory
        }
    }

    #[async_trait]
    impl AccountDirectory for StaticDirectory {
        async fn tier_of(&self, subject: &str) -> std::result::Result<Option<String>, DirectoryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(DirectoryError("connection refused".to_string()));
            }
            Ok(self.tiers.lock().get(subject).cloned())
        }
    }

    fn production() -> LimitsConfig {
        LimitsConfig {
            environment: Environment::Production,
            ..Default::default()
        }
    }

    fn resolver_with(directory: Arc<StaticDirectory>) -> TierResolver {
        TierResolver::new(PresetTable::default(), production()).with_directory(directory)
    }

    #[tokio::test]
    async fn test_upstream_tier_wins() {
        let directory = Arc::new(StaticDirectory::with(&[("u1", "free")]));
        let resolver = resolver_with(directory.clone());

        let request = RequestInfo::new("GET", "/a")
            .with_subject("u1")
            .with_tier("admin");
        assert_eq!(resolver.resolve_tier(&request).await, Tier::Admin);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);

        let request = RequestInfo::new("GET", "/a").with_tier("gold");
        assert_eq!(resolver.resolve_tier(&request).await, Tier::Free);
    }

    #[tokio::test]
    async fn test_directory_lookup_is_cached() {
        let directory = Arc::new(StaticDirectory::with(&[("u1", "premium")]));
        let resolver = resolver_with(directory.clone());
        let request = RequestInfo::new("GET", "/a").with_subject("u1");

        for _ in 0..5 {
            assert_eq!(resolver.resolve_tier(&request).await, Tier::Premium);
        }
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);

        resolver.invalidate("u1");
        resolver.resolve_tier(&request).await;
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_is_refreshed() {
        let directory = Arc::new(StaticDirectory::with(&[("u1", "premium")]));
        let resolver = resolver_with(directory.clone()).with_cache_ttl(Duration::ZERO);
        let request = RequestInfo::new("GET", "/a").with_subject("u1");

        resolver.resolve_tier(&request).await;
        directory
            .tiers
            .lock()
            .insert("u1".to_string(), "admin".to_string());
        assert_eq!(resolver.resolve_tier(&request).await, Tier::Admin);
    }

    #[tokio::test]
    async fn test_anonymous_unknown_and_failing_are_free() {
        let directory = Arc::new(StaticDirectory::default());
        let resolver = resolver_with(directory.clone());

        let anonymous = RequestInfo::new("GET", "/a").with_client_ip("10.0.0.1");
        assert_eq!(resolver.resolve_tier(&anonymous).await, Tier::Free);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);

        let unknown = RequestInfo::new("GET", "/a").with_subject("ghost");
        assert_eq!(resolver.resolve_tier(&unknown).await, Tier::Free);

        directory.failing.store(true, Ordering::SeqCst);
        let other = RequestInfo::new("GET", "/a").with_subject("u2");
        assert_eq!(resolver.resolve_tier(&other).await, Tier::Free);
        assert_eq!(resolver.resolve_tier(&other).await, Tier::Free);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_directory_means_free() {
        let resolver = TierResolver::new(PresetTable::default(), production());
        let request = RequestInfo::new("GET", "/a").with_subject("u1");
        assert_eq!(resolver.resolve_tier(&request).await, Tier::Free);
    }

    #[test]
    fn test_config_for_follows_environment() {
        let resolver = TierResolver::new(PresetTable::default(), production());
        let free = tokio_test::assert_ok!(resolver.config_for(Tier::Free));
        let admin = tokio_test::assert_ok!(resolver.config_for(Tier::Admin));
        assert_eq!(free.max_requests, 100);
        assert_eq!(free.window_ms, 900_000);
        assert!(admin.max_requests > free.max_requests);

        let development = TierResolver::new(PresetTable::default(), LimitsConfig::default());
        assert!(development.config_for(Tier::Free).unwrap().max_requests > free.max_requests);
    }

    #[test]
    fn test_route_config_overrides_status() {
        let resolver = TierResolver::new(PresetTable::default(), production());
        let auth = resolver.route_config("auth").unwrap();
        assert_eq!(auth.status_code, 423);
        assert_eq!(auth.max_requests, 5);
        assert!(auth.message.contains("authentication"));

        let request = RequestInfo::new("POST", "/login").with_client_ip("10.0.0.1");
        assert_eq!((auth.key_fn)(&request), "auth:POST:/login:ip:10.0.0.1");

        let general = resolver.route_config("general").unwrap();
        assert_eq!(general.status_code, 429);

        assert!(matches!(
            resolver.route_config("missing"),
            Err(WardenError::InvalidConfiguration(_))
        ));
    }
}
