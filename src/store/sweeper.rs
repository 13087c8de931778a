//! Periodic removal of stale counters.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::Store;

/// Handle to a running sweep task.
pub struct SweepHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Stop the sweep task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn a task that calls [`Store::sweep`] every `every`.
///
/// The first sweep is delayed by a random fraction of the interval so that
/// instances started together do not sweep in lock-step.
pub fn spawn_sweeper(store: Arc<dyn Store>, every: Duration) -> SweepHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let jitter_ms = rand::thread_rng().gen_range(0..=every.as_millis() as u64);
    let start = tokio::time::Instant::now() + Duration::from_millis(jitter_ms);

    info!(
        backend = store.name(),
        interval_secs = every.as_secs(),
        "Starting counter sweep task"
    );

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(start, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.sweep().await;
                    debug!(removed = removed, "Counter sweep completed");
                }
                _ = stopped.changed() => break,
            }
        }
        debug!("Counter sweep task stopped");
    });

    SweepHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{CounterRecord, LocalStore};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_stale_records() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(LocalStore::with_clock(clock.clone()));
        store.set("k", &CounterRecord::new(0, 1_000)).await.unwrap();
        clock.set(2_000);

        let handle = spawn_sweeper(store.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(store.is_empty());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let store = Arc::new(LocalStore::new());
        let handle = spawn_sweeper(store, Duration::from_secs(60));
        handle.stop().await;
    }
}
