//! Counter storage in an external key-value service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::{CounterRecord, Store, StoreError};
use crate::clock::{Clock, SystemClock};

/// Minimal client surface a TTL-capable key-value service must offer.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`, expiring after `ttl_secs`.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Counter storage shared between instances through a [`KvClient`].
///
/// Records are stored as JSON under `{prefix}:{key}` with an expiry covering
/// both the window and any pending penalty, so the service cleans up after
/// itself. An unreadable payload is logged and treated as a miss. Transport
/// failures are logged and handed back as [`StoreError`] so the
/// [`ResilientStore`](super::ResilientStore) in front can switch backends.
pub struct SharedStore {
    client: Arc<dyn KvClient>,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl SharedStore {
    pub fn new(client: Arc<dyn KvClient>, prefix: &str) -> Self {
        Self::with_clock(client, prefix, Arc::new(SystemClock))
    }

    pub fn with_clock(client: Arc<dyn KvClient>, prefix: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            clock,
        }
    }

    /// Namespaced key used in the backing service.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Liveness of the backing service.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.client.ping().await
    }
}

/// Seconds the record stays meaningful, rounded up. Zero or less means the
/// record can be dropped rather than written.
fn ttl_secs(record: &CounterRecord, now: i64) -> i64 {
    record
        .expires_at()
        .saturating_sub(now)
        .saturating_add(999)
        .div_euclid(1000)
        .max(0)
}

#[async_trait]
impl Store for SharedStore {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        let storage_key = self.storage_key(key);
        let payload = self.client.get(&storage_key).await.map_err(|e| {
            warn!(key = %storage_key, error = %e, "Shared store read failed");
            e
        })?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str(&payload) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Discarding malformed counter record");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, record: &CounterRecord) -> Result<(), StoreError> {
        let storage_key = self.storage_key(key);
        let ttl = ttl_secs(record, self.clock.now_ms());
        if ttl <= 0 {
            trace!(key = %storage_key, "Skipping write of already expired record");
            return Ok(());
        }

        let payload = serde_json::to_string(record)?;
        self.client
            .set_ex(&storage_key, &payload, ttl as u64)
            .await
            .map_err(|e| {
                warn!(key = %storage_key, error = %e, "Shared store write failed");
                e
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let storage_key = self.storage_key(key);
        self.client.del(&storage_key).await.map_err(|e| {
            warn!(key = %storage_key, error = %e, "Shared store delete failed");
            e
        })
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory stand-in for a key-value service.
    #[derive(Default)]
    pub(crate) struct MemoryKv {
        pub(crate) entries: Mutex<HashMap<String, (String, u64)>>,
        pub(crate) failing: AtomicBool,
        pub(crate) calls: AtomicUsize,
    }

    impl MemoryKv {
        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl KvClient for MemoryKv {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.check()?;
            Ok(self.entries.lock().get(key).map(|(v, _)| v.clone()))
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
            self.check()?;
            self.entries
                .lock()
                .insert(key.to_string(), (value.to_string(), ttl_secs));
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            self.entries.lock().remove(key);
            Ok(())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.check()
        }
    }

    fn store_at(now: i64) -> (Arc<MemoryKv>, SharedStore) {
        let kv = Arc::new(MemoryKv::default());
        let store = SharedStore::with_clock(kv.clone(), "ratelimit", Arc::new(ManualClock::new(now)));
        (kv, store)
    }

    #[tokio::test]
    async fn test_round_trip_under_namespaced_key() {
        let (kv, store) = store_at(0);
        let record = CounterRecord::new(0, 60_000);

        store.set("GET:/users:ip:1.2.3.4", &record).await.unwrap();
        assert!(kv.entries.lock().contains_key("ratelimit:GET:/users:ip:1.2.3.4"));
        assert_eq!(store.get("GET:/users:ip:1.2.3.4").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_ttl_covers_penalty() {
        let (kv, store) = store_at(0);
        let mut record = CounterRecord::new(0, 1_500);
        store.set("a", &record).await.unwrap();
        assert_eq!(kv.entries.lock()["ratelimit:a"].1, 2);

        record.penalty_until = Some(30_001);
        store.set("a", &record).await.unwrap();
        assert_eq!(kv.entries.lock()["ratelimit:a"].1, 31);
    }

    #[tokio::test]
    async fn test_expired_record_is_not_written() {
        let (kv, store) = store_at(10_000);
        let record = CounterRecord::new(0, 1_000);

        store.set("old", &record).await.unwrap();
        assert!(kv.entries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_miss() {
        let (kv, store) = store_at(0);
        kv.entries
            .lock()
            .insert("ratelimit:bad".to_string(), ("{not json".to_string(), 10));

        assert!(store.get("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let (kv, store) = store_at(0);
        kv.set_failing(true);

        assert!(matches!(store.get("a").await, Err(StoreError::Unavailable(_))));
        assert!(store.set("a", &CounterRecord::new(0, 1_000)).await.is_err());
        assert!(store.delete("a").await.is_err());
    }
}
