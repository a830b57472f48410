use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{IdempotencyStore, StoreError};

/// Periodically purges expired entries and stale claims.
///
/// A failed or panicking sweep is logged and the next tick runs as usual.
#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn IdempotencyStore>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn IdempotencyStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let started = Instant::now();
        let store = self.store.clone();

        let outcome = match tokio::spawn(async move { store.delete_expired().await }).await {
            Ok(result) => result,
            Err(join_error) => Err(StoreError::Unavailable(format!(
                "idempotency sweep task failed: {join_error}"
            ))),
        };

        let elapsed_ms = started.elapsed().as_millis();
        match &outcome {
            Ok(removed) => info!(removed, elapsed_ms, "idempotency sweep completed"),
            Err(error) => error!(%error, elapsed_ms, "idempotency sweep failed"),
        }

        outcome
    }

    /// First sweep fires one interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("idempotency sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = self.run_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use tokio_util::sync::CancellationToken;

    use super::ExpirySweeper;
    use crate::idempotency::{
        CachedResponse, ClaimOutcome, ClaimToken, IdempotencyStore, InMemoryIdempotencyStore,
        StoreEntry, StoreError,
    };

    const KEY: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[tokio::test]
    async fn run_once_purges_expired_entries() {
        let store = Arc::new(InMemoryIdempotencyStore::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
        ));
        let now = Utc::now();
        let expired = StoreEntry {
            key: KEY.to_string(),
            fingerprint: "old".to_string(),
            response: CachedResponse::new(200, None, b"{}".to_vec()),
            created_at: now - TimeDelta::hours(25),
            expires_at: now - TimeDelta::hours(1),
        };
        assert!(expired.is_expired_at(now));
        store.insert_entry(expired).expect("seed");
        store
            .store(KEY, "new", CachedResponse::new(200, None, b"{}".to_vec()))
            .await
            .expect("store");

        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(3600));

        assert_eq!(sweeper.run_once().await.expect("sweep"), 1);
        assert_eq!(sweeper.run_once().await.expect("sweep"), 0);
        assert!(store.contains(KEY, "new").await.expect("contains"));
    }

    /// Fails on the first sweep, panics on the second, then succeeds.
    #[derive(Default)]
    struct FlakyStore {
        sweeps: AtomicUsize,
    }

    #[async_trait]
    impl IdempotencyStore for FlakyStore {
        async fn lookup(&self, _: &str, _: &str) -> Result<Option<CachedResponse>, StoreError> {
            Ok(None)
        }

        async fn has_conflict(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn store(&self, _: &str, _: &str, _: CachedResponse) -> Result<(), StoreError> {
            Ok(())
        }

        async fn try_claim(&self, _: &str, _: &str) -> Result<ClaimOutcome, StoreError> {
            Ok(ClaimOutcome::Acquired(ClaimToken::new()))
        }

        async fn complete(
            &self,
            _: &str,
            _: &str,
            _: ClaimToken,
            _: CachedResponse,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn release(&self, _: &str, _: &str, _: ClaimToken) -> Result<(), StoreError> {
            Ok(())
        }

        async fn contains(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete_expired(&self) -> Result<usize, StoreError> {
            match self.sweeps.fetch_add(1, Ordering::SeqCst) {
                0 => Err(StoreError::Unavailable("disk full".to_string())),
                1 => panic!("sweep exploded"),
                _ => Ok(3),
            }
        }
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_stop_later_sweeps() {
        let store = Arc::new(FlakyStore::default());
        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(3600));

        assert!(sweeper.run_once().await.is_err());
        assert!(sweeper.run_once().await.is_err());
        assert_eq!(sweeper.run_once().await.expect("third sweep"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_sweeper_ticks_until_cancelled() {
        let store = Arc::new(FlakyStore::default());
        let shutdown = CancellationToken::new();
        let handle = ExpirySweeper::new(store.clone(), Duration::from_secs(60))
            .spawn(shutdown.clone());

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        handle.await.expect("sweeper task should exit cleanly");

        assert!(store.sweeps.load(Ordering::SeqCst) >= 3);
    }
}
