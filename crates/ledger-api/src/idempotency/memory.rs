use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::table::EntryTable;
use super::{CachedResponse, ClaimOutcome, ClaimToken, IdempotencyStore, StoreEntry, StoreError};

/// Process-local store. Entries are lost on restart.
#[derive(Debug, Clone)]
pub struct InMemoryIdempotencyStore {
    table: Arc<Mutex<EntryTable>>,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration, claim_timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(EntryTable::new(ttl, claim_timeout))),
        }
    }

    /// Seeds an entry with explicit timestamps, bypassing the TTL.
    pub fn insert_entry(&self, entry: StoreEntry) -> Result<(), StoreError> {
        self.table()?.insert_entry(entry);
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        Ok(self.table()?.entries())
    }

    fn table(&self) -> Result<MutexGuard<'_, EntryTable>, StoreError> {
        self.table
            .lock()
            .map_err(|_| StoreError::Unavailable("idempotency store lock poisoned".to_string()))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn lookup(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<Option<CachedResponse>, StoreError> {
        Ok(self.table()?.lookup(key, fingerprint, Utc::now()))
    }

    async fn has_conflict(&self, key: &str, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.table()?.has_conflict(key, fingerprint, Utc::now()))
    }

    async fn store(
        &self,
        key: &str,
        fingerprint: &str,
        response: CachedResponse,
    ) -> Result<(), StoreError> {
        self.table()?.store(key, fingerprint, response, Utc::now());
        Ok(())
    }

    async fn try_claim(&self, key: &str, fingerprint: &str) -> Result<ClaimOutcome, StoreError> {
        Ok(self.table()?.try_claim(key, fingerprint, Utc::now()))
    }

    async fn complete(
        &self,
        key: &str,
        fingerprint: &str,
        token: ClaimToken,
        response: CachedResponse,
    ) -> Result<bool, StoreError> {
        Ok(self
            .table()?
            .complete(key, fingerprint, token, response, Utc::now()))
    }

    async fn release(
        &self,
        key: &str,
        fingerprint: &str,
        token: ClaimToken,
    ) -> Result<(), StoreError> {
        self.table()?.release(key, fingerprint, token);
        Ok(())
    }

    async fn contains(&self, key: &str, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.table()?.contains(key, fingerprint))
    }

    async fn delete_expired(&self) -> Result<usize, StoreError> {
        let removed = self.table()?.delete_expired(Utc::now());
        debug!(removed, "purged expired in-memory idempotency entries");
        Ok(removed)
    }
}
