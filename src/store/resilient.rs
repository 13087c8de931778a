//! Shared storage with automatic degrade to local memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CounterRecord, LocalStore, SharedStore, Store, StoreError};

/// Default wait before a failed shared backend is tried again.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Which backend is currently serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// The shared backend is healthy and authoritative.
    UsingShared,
    /// Local memory is serving; `since` is when the shared backend last
    /// failed, or `None` if no shared backend is configured.
    UsingLocal { since: Option<Instant> },
}

/// Snapshot returned by [`ResilientStore::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `"shared"` or `"local"`
    pub primary: &'static str,
    /// Whether the shared backend answered a ping
    pub shared: bool,
    /// Whether local memory is usable
    pub local: bool,
}

/// A [`Store`] façade over an optional [`SharedStore`] and a [`LocalStore`].
///
/// Storage problems never reach the caller: any shared-backend failure flips
/// the state to [`BackendState::UsingLocal`] and the same operation is served
/// from local memory. Once `retry_after` has passed, the next operation
/// probes the shared backend again and switches back if it answers. While the
/// shared backend is healthy its writes are mirrored locally so a later
/// switch starts from warm counters.
pub struct ResilientStore {
    shared: Option<SharedStore>,
    local: Arc<LocalStore>,
    state: RwLock<BackendState>,
    retry_after: Duration,
}

impl ResilientStore {
    /// Prefer `shared`, falling back to `local`.
    pub fn new(shared: SharedStore, local: Arc<LocalStore>) -> Self {
        Self {
            shared: Some(shared),
            local,
            state: RwLock::new(BackendState::UsingShared),
            retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    /// Serve from local memory only.
    pub fn local_only(local: Arc<LocalStore>) -> Self {
        Self {
            shared: None,
            local,
            state: RwLock::new(BackendState::UsingLocal { since: None }),
            retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    /// Override how long a failed shared backend is left alone.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn state(&self) -> BackendState {
        *self.state.read()
    }

    pub fn is_using_shared(&self) -> bool {
        self.state() == BackendState::UsingShared
    }

    /// The local fallback store.
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Ping the shared backend and report which backend is serving.
    pub async fn health_check(&self) -> HealthReport {
        let shared_alive = match &self.shared {
            Some(shared) => match shared.ping().await {
                Ok(()) => {
                    self.mark_healthy();
                    true
                }
                Err(e) => {
                    self.mark_failed(&e);
                    false
                }
            },
            None => false,
        };

        HealthReport {
            primary: if self.is_using_shared() { "shared" } else { "local" },
            shared: shared_alive,
            local: true,
        }
    }

    /// The shared backend, if it should be tried for the next operation.
    fn active_shared(&self) -> Option<&SharedStore> {
        let shared = self.shared.as_ref()?;
        match self.state() {
            BackendState::UsingShared => Some(shared),
            BackendState::UsingLocal { since: Some(since) } if since.elapsed() >= self.retry_after => {
                debug!("Probing shared rate limit backend");
                Some(shared)
            }
            BackendState::UsingLocal { .. } => None,
        }
    }

    fn mark_healthy(&self) {
        let mut state = self.state.write();
        if *state != BackendState::UsingShared {
            info!("Shared rate limit backend recovered, switching back");
            *state = BackendState::UsingShared;
        }
    }

    fn mark_failed(&self, error: &StoreError) {
        let mut state = self.state.write();
        match *state {
            BackendState::UsingShared => {
                warn!(error = %error, "Shared rate limit backend failed, falling back to local memory");
            }
            BackendState::UsingLocal { .. } => {
                debug!(error = %error, "Shared rate limit backend still unavailable");
            }
        }
        *state = BackendState::UsingLocal {
            since: Some(Instant::now()),
        };
    }
}

#[async_trait]
impl Store for ResilientStore {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        if let Some(shared) = self.active_shared() {
            match shared.get(key).await {
                Ok(record) => {
                    self.mark_healthy();
                    return Ok(record);
                }
                Err(e) => self.mark_failed(&e),
            }
        }
        self.local.get(key).await
    }

    async fn set(&self, key: &str, record: &CounterRecord) -> Result<(), StoreError> {
        if let Some(shared) = self.active_shared() {
            match shared.set(key, record).await {
                Ok(()) => self.mark_healthy(),
                Err(e) => self.mark_failed(&e),
            }
        }
        self.local.set(key, record).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Some(shared) = self.active_shared() {
            match shared.delete(key).await {
                Ok(()) => self.mark_healthy(),
                Err(e) => self.mark_failed(&e),
            }
        }
        self.local.delete(key).await
    }

    async fn sweep(&self) -> usize {
        self.local.sweep().await
    }

    fn name(&self) -> &'static str {
        if self.is_using_shared() {
            "shared"
        } else {
            "local"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use std::sync::atomic::Ordering;

    fn resilient() -> (Arc<MemoryKv>, ResilientStore) {
        let kv = Arc::new(MemoryKv::default());
        let shared = SharedStore::new(kv.clone(), "ratelimit");
        (kv, ResilientStore::new(shared, Arc::new(LocalStore::new())))
    }

    fn fresh_record() -> CounterRecord {
        CounterRecord::new(chrono::Utc::now().timestamp_millis(), 60_000)
    }

    #[tokio::test]
    async fn test_healthy_shared_serves_and_mirrors() {
        let (kv, store) = resilient();
        let record = fresh_record();

        store.set("k", &record).await.unwrap();
        assert!(store.is_using_shared());
        assert!(kv.entries.lock().contains_key("ratelimit:k"));
        assert_eq!(store.local().get("k").await.unwrap(), Some(record.clone()));
        assert_eq!(store.get("k").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_failing_shared_falls_back_without_error() {
        let (kv, store) = resilient();
        kv.set_failing(true);
        let record = fresh_record();

        assert!(store.set("k", &record).await.is_ok());
        assert!(!store.is_using_shared());
        assert_eq!(store.get("k").await.unwrap(), Some(record));
        assert!(store.delete("k").await.is_ok());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_backend_is_not_retried_before_deadline() {
        let (kv, store) = resilient();
        kv.set_failing(true);

        store.get("k").await.unwrap();
        let calls = kv.calls.load(Ordering::SeqCst);
        for _ in 0..10 {
            store.get("k").await.unwrap();
        }
        assert_eq!(kv.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_recovers_after_retry_window() {
        let kv = Arc::new(MemoryKv::default());
        let store = ResilientStore::new(
            SharedStore::new(kv.clone(), "ratelimit"),
            Arc::new(LocalStore::new()),
        )
        .with_retry_after(Duration::ZERO);

        kv.set_failing(true);
        store.get("k").await.unwrap();
        assert!(matches!(store.state(), BackendState::UsingLocal { since: Some(_) }));

        kv.set_failing(false);
        store.get("k").await.unwrap();
        assert_eq!(store.state(), BackendState::UsingShared);
    }

    #[tokio::test]
    async fn test_health_check_reports_backend() {
        let (kv, store) = resilient();
        assert_eq!(
            store.health_check().await,
            HealthReport {
                primary: "shared",
                shared: true,
                local: true
            }
        );

        kv.set_failing(true);
        let report = store.health_check().await;
        assert_eq!(report.primary, "local");
        assert!(!report.shared);
        assert!(report.local);
    }

    #[tokio::test]
    async fn test_local_only_never_uses_shared() {
        let store = ResilientStore::local_only(Arc::new(LocalStore::new()));
        assert_eq!(store.state(), BackendState::UsingLocal { since: None });

        store.set("k", &fresh_record()).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        assert_eq!(store.health_check().await.primary, "local");
    }
}
