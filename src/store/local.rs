//! In-process counter storage.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CounterRecord, Store, StoreError};
use crate::clock::{Clock, SystemClock};

/// Counter storage held in process memory.
///
/// Authoritative when no shared backend is configured, and the fallback
/// behind [`ResilientStore`](super::ResilientStore) otherwise. Records are
/// only removed by [`Store::sweep`] or an explicit delete.
pub struct LocalStore {
    records: DashMap<String, CounterRecord>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that judges staleness with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, record: &CounterRecord) -> Result<(), StoreError> {
        self.records.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }

    async fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_stale(now));
        let removed = before.saturating_sub(self.records.len());

        if removed > 0 {
            debug!(removed = removed, remaining = self.records.len(), "Swept stale counters");
        }
        removed
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = LocalStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        let record = CounterRecord::new(0, 1_000);
        store.set("k", &record).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(record));

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_records() {
        let clock = Arc::new(ManualClock::new(0));
        let store = LocalStore::with_clock(clock.clone());

        store.set("expired", &CounterRecord::new(0, 1_000)).await.unwrap();
        store.set("live", &CounterRecord::new(0, 10_000)).await.unwrap();

        let mut penalized = CounterRecord::new(0, 1_000);
        penalized.penalty_until = Some(60_000);
        store.set("penalized", &penalized).await.unwrap();

        clock.set(5_000);
        assert_eq!(store.sweep().await, 1);
        assert!(store.get("expired").await.unwrap().is_none());
        assert!(store.get("live").await.unwrap().is_some());
        assert!(store.get("penalized").await.unwrap().is_some());

        clock.set(60_001);
        assert_eq!(store.sweep().await, 2);
        assert_eq!(store.len(), 0);
    }
}
