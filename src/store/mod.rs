//! Counter storage backends.
//!
//! Every backend speaks the same small [`Store`] contract. [`LocalStore`] keeps
//! counters in process memory, [`SharedStore`] keeps them in a TTL-capable
//! key-value service so several instances see the same counts, and
//! [`ResilientStore`] puts the two behind one façade that degrades to local
//! memory whenever the shared service misbehaves.

mod local;
mod record;
mod redis_kv;
mod resilient;
mod shared;
mod sweeper;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalStore;
pub use record::CounterRecord;
pub use redis_kv::RedisKv;
pub use resilient::{BackendState, HealthReport, ResilientStore};
pub use shared::{KvClient, SharedStore};
pub use sweeper::{spawn_sweeper, SweepHandle};

#[cfg(test)]
pub(crate) use shared::tests::MemoryKv;

/// Errors raised by counter storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to encode counter record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage contract for rate limit counters.
///
/// Implementations are free to expire records on their own (TTL); the
/// limiter never assumes a stored record is still inside its window.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the record for `key`, if one exists.
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StoreError>;

    /// Insert or replace the record for `key`.
    async fn set(&self, key: &str, record: &CounterRecord) -> Result<(), StoreError>;

    /// Remove the record for `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop records whose window and penalty have both elapsed.
    ///
    /// Returns the number of records removed. Backends with native expiry
    /// have nothing to do here.
    async fn sweep(&self) -> usize {
        0
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
