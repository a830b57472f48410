//! Idempotent handling of retried mutating requests.
//!
//! A client opts in by sending an `Idempotency-Key` header. The request body is
//! fingerprinted, and the pair `(key, fingerprint)` indexes a cached response in
//! an [`IdempotencyStore`]. A retry with the same pair replays the cached
//! response; the same key with a different body is a conflict.

mod file;
mod fingerprint;
pub mod interceptor;
mod key;
mod memory;
mod sweeper;
mod table;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ApiConfig, StoreBackend};

pub use self::file::FileIdempotencyStore;
pub use self::fingerprint::Fingerprint;
pub use self::interceptor::{IDEMPOTENCY_KEY_HEADER, IdempotencyInterceptor};
pub use self::key::is_valid_key;
pub use self::memory::InMemoryIdempotencyStore;
pub use self::sweeper::ExpirySweeper;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }
}

/// A completed response persisted under `(key, fingerprint)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub fingerprint: String,
    pub response: CachedResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoreEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Identifies the holder of one in-flight claim.
///
/// A claim that went stale and was taken over gets a new token, so the
/// original holder can no longer complete or release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Result of atomically reserving `(key, fingerprint)` for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the pair and must either `complete` or `release` it.
    Acquired(ClaimToken),
    /// Another request already finished; replay its response.
    Completed(CachedResponse),
    /// Another request holds the claim and has not finished yet.
    InFlight,
    /// The key is live under a different fingerprint.
    Conflict,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotency snapshot '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Storage contract behind the idempotency protocol.
///
/// Empty keys or fingerprints never error: reads behave as "not found" or
/// "no conflict", writes are no-ops, and `try_claim` acquires without
/// reserving anything.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Completed, unexpired response for exactly this pair. Expired entries
    /// found here are deleted.
    async fn lookup(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<Option<CachedResponse>, StoreError>;

    /// Whether `key` is live under any fingerprint other than `fingerprint`.
    async fn has_conflict(&self, key: &str, fingerprint: &str) -> Result<bool, StoreError>;

    /// Writes the response with a fresh TTL. Repeating the call for the same
    /// pair overwrites and never fails.
    async fn store(
        &self,
        key: &str,
        fingerprint: &str,
        response: CachedResponse,
    ) -> Result<(), StoreError>;

    async fn try_claim(&self, key: &str, fingerprint: &str) -> Result<ClaimOutcome, StoreError>;

    /// Stores the response only while `token` still holds the claim on the
    /// pair. Returns `false`, writing nothing, once the claim was taken over
    /// or swept.
    async fn complete(
        &self,
        key: &str,
        fingerprint: &str,
        token: ClaimToken,
        response: CachedResponse,
    ) -> Result<bool, StoreError>;

    /// Drops the claim held by `token`. Completed entries and claims held by
    /// anyone else are left untouched.
    async fn release(
        &self,
        key: &str,
        fingerprint: &str,
        token: ClaimToken,
    ) -> Result<(), StoreError>;

    /// Whether a completed entry exists for the pair, expired or not.
    async fn contains(&self, key: &str, fingerprint: &str) -> Result<bool, StoreError>;

    /// Removes every expired entry and stale claim; returns how many went.
    async fn delete_expired(&self) -> Result<usize, StoreError>;
}

pub fn from_config(config: &ApiConfig) -> Result<Arc<dyn IdempotencyStore>> {
    let ttl = Duration::from_secs(config.idempotency_ttl_secs);
    let claim_timeout = Duration::from_secs(config.idempotency_claim_timeout_secs);

    match config.idempotency_store {
        StoreBackend::Memory => Ok(Arc::new(InMemoryIdempotencyStore::new(ttl, claim_timeout))),
        StoreBackend::File => {
            let store = FileIdempotencyStore::open(&config.data_dir, ttl, claim_timeout)
                .with_context(|| {
                    format!(
                        "failed opening idempotency store under '{}'",
                        config.data_dir.display()
                    )
                })?;
            Ok(Arc::new(store))
        }
    }
}
