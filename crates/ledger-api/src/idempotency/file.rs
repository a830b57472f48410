use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::table::EntryTable;
use super::{CachedResponse, ClaimOutcome, ClaimToken, IdempotencyStore, StoreEntry, StoreError};

const SNAPSHOT_PATH: &str = ".ledger/api/idempotency-v1.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct IdempotencySnapshot {
    entries: Vec<IdempotencyRow>,
}

/// One persisted row, unique on `(idempotency_key, request_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdempotencyRow {
    idempotency_key: String,
    request_hash: String,
    status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    /// Hex-encoded so arbitrary response bytes survive the JSON round trip.
    response_body: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<StoreEntry> for IdempotencyRow {
    fn from(entry: StoreEntry) -> Self {
        Self {
            idempotency_key: entry.key,
            request_hash: entry.fingerprint,
            status_code: entry.response.status,
            content_type: entry.response.content_type,
            response_body: hex::encode(entry.response.body),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        }
    }
}

impl IdempotencyRow {
    fn into_entry(self) -> Result<StoreEntry, String> {
        let body = hex::decode(&self.response_body).map_err(|error| {
            format!(
                "response body for key '{}' is not valid hex: {error}",
                self.idempotency_key
            )
        })?;

        Ok(StoreEntry {
            key: self.idempotency_key,
            fingerprint: self.request_hash,
            response: CachedResponse::new(self.status_code, self.content_type, body),
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

/// Durable store backed by a JSON snapshot under the data directory.
///
/// Every change to completed entries rewrites the snapshot before the call
/// returns. In-flight claims stay in memory.
#[derive(Debug)]
pub struct FileIdempotencyStore {
    path: PathBuf,
    table: Mutex<EntryTable>,
}

impl FileIdempotencyStore {
    pub fn open(
        data_dir: impl AsRef<Path>,
        ttl: Duration,
        claim_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let path = data_dir.as_ref().join(SNAPSHOT_PATH);
        let mut table = EntryTable::new(ttl, claim_timeout);

        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|error| {
                StoreError::Unavailable(format!(
                    "failed reading idempotency snapshot '{}': {error}",
                    path.display()
                ))
            })?;

            let snapshot: IdempotencySnapshot =
                serde_json::from_str(&content).map_err(|error| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: error.to_string(),
                })?;

            let now = Utc::now();
            let mut skipped = 0;
            for row in snapshot.entries {
                let entry = row.into_entry().map_err(|reason| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason,
                })?;
                if entry.is_expired_at(now) {
                    skipped += 1;
                    continue;
                }
                table.insert_entry(entry);
            }
            table.take_dirty();
            // Rewrite on the next mutation so the expired rows leave the file.
            if skipped > 0 {
                table.mark_dirty();
            }

            info!(
                path = %path.display(),
                entries = table.entries().len(),
                skipped,
                "loaded idempotency snapshot"
            );
        }

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist_if_dirty(&self, table: &mut EntryTable) -> Result<(), StoreError> {
        if !table.take_dirty() {
            return Ok(());
        }

        if let Err(error) = self.persist(table).await {
            table.mark_dirty();
            return Err(error);
        }

        Ok(())
    }

    async fn persist(&self, table: &EntryTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                StoreError::Unavailable(format!(
                    "failed to create idempotency snapshot directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }

        let snapshot = IdempotencySnapshot {
            entries: table
                .entries()
                .into_iter()
                .map(IdempotencyRow::from)
                .collect(),
        };

        let payload = serde_json::to_string_pretty(&snapshot).map_err(|error| {
            StoreError::Unavailable(format!("failed to serialize idempotency entries: {error}"))
        })?;

        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, payload).await.map_err(|error| {
            StoreError::Unavailable(format!(
                "failed to write idempotency snapshot '{}': {error}",
                staging.display()
            ))
        })?;

        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|error| {
                StoreError::Unavailable(format!(
                    "failed to replace idempotency snapshot '{}': {error}",
                    self.path.display()
                ))
            })?;

        debug!(path = %self.path.display(), entries = snapshot.entries.len(), "persisted idempotency snapshot");
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for FileIdempotencyStore {
    async fn lookup(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<Option<CachedResponse>, StoreError> {
        let mut table = self.table.lock().await;
        let response = table.lookup(key, fingerprint, Utc::now());

        // The eviction is already in effect in memory; a failed write is
        // retried with the next mutation.
        if let Err(error) = self.persist_if_dirty(&mut table).await {
            warn!(%error, "failed persisting lazy idempotency eviction");
        }

        Ok(response)
    }

    async fn has_conflict(&self, key: &str, fingerprint: &str) -> Result<bool, StoreError> {
        let table = self.table.lock().await;
        Ok(table.has_conflict(key, fingerprint, Utc::now()))
    }

    async fn store(
        &self,
        key: &str,
        fingerprint: &str,
        response: CachedResponse,
    ) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        table.store(key, fingerprint, response, Utc::now());
        self.persist_if_dirty(&mut table).await
    }

    async fn try_claim(&self, key: &str, fingerprint: &str) -> Result<ClaimOutcome, StoreError> {
        let mut table = self.table.lock().await;
        let outcome = table.try_claim(key, fingerprint, Utc::now());

        if let Err(error) = self.persist_if_dirty(&mut table).await {
            // The caller never learns the token, so the claim must not outlive this call.
            if let ClaimOutcome::Acquired(token) = outcome {
                table.release(key, fingerprint, token);
            }
            return Err(error);
        }

        Ok(outcome)
    }

    async fn complete(
        &self,
        key: &str,
        fingerprint: &str,
        token: ClaimToken,
        response: CachedResponse,
    ) -> Result<bool, StoreError> {
        let mut table = self.table.lock().await;
        if !table.complete(key, fingerprint, token, response, Utc::now()) {
            return Ok(false);
        }
        self.persist_if_dirty(&mut table).await?;
        Ok(true)
    }

    async fn release(
        &self,
        key: &str,
        fingerprint: &str,
        token: ClaimToken,
    ) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        table.release(key, fingerprint, token);
        Ok(())
    }

    async fn contains(&self, key: &str, fingerprint: &str) -> Result<bool, StoreError> {
        let table = self.table.lock().await;
        Ok(table.contains(key, fingerprint))
    }

    async fn delete_expired(&self) -> Result<usize, StoreError> {
        let mut table = self.table.lock().await;
        let removed = table.delete_expired(Utc::now());
        self.persist_if_dirty(&mut table).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, Utc};

    use super::{FileIdempotencyStore, SNAPSHOT_PATH};
    use crate::idempotency::{
        CachedResponse, ClaimOutcome, IdempotencyStore, StoreEntry, StoreError,
    };

    const KEY: &str = "550e8400-e29b-41d4-a716-446655440000";
    const TTL: Duration = Duration::from_secs(24 * 60 * 60);
    const CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn cached_responses_survive_reopen() {
        let workspace = tempfile::tempdir().expect("tempdir should be created");
        let cached = CachedResponse::new(
            200,
            Some("application/json".to_string()),
            br#"{"id":"I1"}"#.to_vec(),
        );

        {
            let store = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
                .expect("store should open");
            store
                .store(KEY, "f1", cached.clone())
                .await
                .expect("store should persist");
            assert!(store.path().exists());
        }

        let reopened = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should reopen");
        assert_eq!(
            reopened.lookup(KEY, "f1").await.expect("lookup should succeed"),
            Some(cached)
        );
        assert!(
            reopened
                .has_conflict(KEY, "f2")
                .await
                .expect("conflict check should succeed")
        );
    }

    #[tokio::test]
    async fn non_utf8_bodies_round_trip() {
        let workspace = tempfile::tempdir().expect("tempdir should be created");
        let cached = CachedResponse::new(200, None, vec![0xff, 0x00, 0xfe]);

        let store = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should open");
        store.store(KEY, "f1", cached.clone()).await.expect("store should persist");
        drop(store);

        let reopened = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should reopen");
        assert_eq!(
            reopened.lookup(KEY, "f1").await.expect("lookup should succeed"),
            Some(cached)
        );
    }

    #[tokio::test]
    async fn delete_expired_is_persisted() {
        let workspace = tempfile::tempdir().expect("tempdir should be created");
        let expired_ttl = Duration::from_secs(1);

        let store = FileIdempotencyStore::open(workspace.path(), expired_ttl, CLAIM_TIMEOUT)
            .expect("store should open");
        store
            .store(KEY, "f1", CachedResponse::new(200, None, b"{}".to_vec()))
            .await
            .expect("store should persist");
        {
            let mut table = store.table.lock().await;
            let mut entries = table.entries();
            entries[0].expires_at = Utc::now() - TimeDelta::hours(1);
            table.insert_entry(entries.remove(0));
        }

        assert_eq!(store.delete_expired().await.expect("sweep should succeed"), 1);
        drop(store);

        let reopened = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should reopen");
        assert!(
            !reopened
                .contains(KEY, "f1")
                .await
                .expect("contains should succeed")
        );
    }

    #[test]
    fn corrupt_snapshots_fail_to_open() {
        let workspace = tempfile::tempdir().expect("tempdir should be created");
        let path = workspace.path().join(SNAPSHOT_PATH);
        std::fs::create_dir_all(path.parent().expect("snapshot path has a parent"))
            .expect("snapshot dir should be created");
        std::fs::write(&path, "not json").expect("snapshot should be written");

        let result = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    fn expired_entry() -> StoreEntry {
        let now = Utc::now();
        StoreEntry {
            key: KEY.to_string(),
            fingerprint: "f1".to_string(),
            response: CachedResponse::new(200, None, b"{}".to_vec()),
            created_at: now - TimeDelta::hours(25),
            expires_at: now - TimeDelta::hours(1),
        }
    }

    #[tokio::test]
    async fn failed_claim_persist_leaves_no_claim_behind() {
        let workspace = tempfile::tempdir().expect("tempdir should be created");
        let store = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should open");
        store.table.lock().await.insert_entry(expired_entry());

        // A plain file where the snapshot directory should be makes every write fail.
        let blocker = workspace.path().join(".ledger");
        std::fs::write(&blocker, "").expect("blocker should be written");

        assert!(matches!(
            store.try_claim(KEY, "f1").await,
            Err(StoreError::Unavailable(_))
        ));

        std::fs::remove_file(&blocker).expect("blocker should be removed");
        assert!(matches!(
            store.try_claim(KEY, "f1").await.expect("claim should succeed"),
            ClaimOutcome::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn completing_a_claim_persists_the_response() {
        let workspace = tempfile::tempdir().expect("tempdir should be created");
        let cached = CachedResponse::new(200, None, b"{}".to_vec());

        let store = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should open");
        let ClaimOutcome::Acquired(token) = store.try_claim(KEY, "f1").await.expect("claim") else {
            panic!("fresh pair should be claimable");
        };
        assert!(
            store
                .complete(KEY, "f1", token, cached.clone())
                .await
                .expect("complete should persist")
        );
        drop(store);

        let reopened = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should reopen");
        assert_eq!(
            reopened.lookup(KEY, "f1").await.expect("lookup should succeed"),
            Some(cached)
        );
    }

    #[tokio::test]
    async fn expired_rows_are_dropped_on_open() {
        let workspace = tempfile::tempdir().expect("tempdir should be created");
        {
            let store = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
                .expect("store should open");
            let mut table = store.table.lock().await;
            table.insert_entry(expired_entry());
            store.persist(&table).await.expect("snapshot should be written");
        }

        let reopened = FileIdempotencyStore::open(workspace.path(), TTL, CLAIM_TIMEOUT)
            .expect("store should reopen");
        assert!(!reopened.contains(KEY, "f1").await.expect("contains should succeed"));
    }
}
