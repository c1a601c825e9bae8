//! Distributed claim tracking backed by a conditional key-value store.
//!
//! The orchestrator claims each record identity before bundling it. A claim
//! that already exists marks the record as a duplicate delivery; the claim
//! expires after a TTL so the store does not grow without bound.

use std::{sync::Arc, time::Duration as StdDuration};

use anyhow::{Context, Result};
use async_nats::jetstream::{
    Context as JsContext,
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind},
};
use async_trait::async_trait;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Result of a conditional claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First sighting; the caller should bundle the record.
    New,
    /// Already claimed within the TTL window; skip the record.
    Duplicate,
}

/// The claim store failed for a reason other than "already claimed".
/// Retryable: the envelope goes back to the queue.
#[derive(Debug, Error)]
#[error("claim store unavailable: {0}")]
pub struct TransientStoreError(#[source] pub anyhow::Error);

/// Contract implemented by claim stores: a single conditional write that
/// succeeds only when the partition key does not already exist.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn put_if_absent(
        &self,
        key: &str,
        original_key: &str,
        ttl: StdDuration,
    ) -> Result<ClaimOutcome>;
}

/// Shared trait object wrapper.
pub type SharedClaimStore = Arc<dyn ClaimStore>;

/// Simple in-memory store used in tests and single-process local runs.
#[derive(Clone, Default)]
pub struct InMemoryClaimStore {
    inner: Arc<RwLock<std::collections::HashMap<String, OffsetDateTime>>>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) {
        let mut guard = self.inner.write().await;
        guard.retain(|_, expires| *expires > now);
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn put_if_absent(
        &self,
        key: &str,
        _original_key: &str,
        ttl: StdDuration,
    ) -> Result<ClaimOutcome> {
        let ttl = Duration::seconds(ttl.as_secs() as i64);
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        match guard.get(key) {
            Some(expires) if *expires > now => Ok(ClaimOutcome::Duplicate),
            _ => {
                guard.insert(key.to_string(), now + ttl);
                Ok(ClaimOutcome::New)
            }
        }
    }
}

/// JetStream-backed claim store.
pub struct NatsKvClaimStore {
    bucket: kv::Store,
}

impl NatsKvClaimStore {
    /// Ensures the JetStream KV bucket exists (or creates it) and returns a
    /// store handle.
    pub async fn new(js: &JsContext, bucket_name: &str) -> Result<Self> {
        let bucket = match js.get_key_value(bucket_name).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(kv::Config {
                    bucket: bucket_name.to_string(),
                    description: "aggregation claim records".into(),
                    history: 1,
                    max_age: StdDuration::from_secs(0),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("create JetStream KV bucket {bucket_name}"))?,
            Err(err) => anyhow::bail!("claim store init failed: {err}"),
        };
        Ok(Self { bucket })
    }
}

#[async_trait]
impl ClaimStore for NatsKvClaimStore {
    #[instrument(name = "claims.put_if_absent", skip(self, original_key), fields(key = %key))]
    async fn put_if_absent(
        &self,
        key: &str,
        original_key: &str,
        ttl: StdDuration,
    ) -> Result<ClaimOutcome> {
        let ttl = ttl.max(StdDuration::from_secs(1));
        let expires_at = OffsetDateTime::now_utc().unix_timestamp() + ttl.as_secs() as i64;
        let payload = serde_json::to_vec(&serde_json::json!({
            "original_key": original_key,
            "expires_at": expires_at,
        }))?;

        match self.bucket.create_with_ttl(key, payload.into(), ttl).await {
            Ok(_) => Ok(ClaimOutcome::New),
            Err(err) if err.kind() == CreateErrorKind::AlreadyExists => {
                Ok(ClaimOutcome::Duplicate)
            }
            Err(err) => Err(anyhow::anyhow!(err)
                .context(format!("claim {key} with ttl {}s", ttl.as_secs()))),
        }
    }
}

/// Guard the orchestrator consults once per record.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: SharedClaimStore,
    ttl: StdDuration,
}

impl IdempotencyGuard {
    pub fn new(store: SharedClaimStore, ttl: StdDuration) -> Self {
        Self { store, ttl }
    }

    /// Attempts to claim `key`. `New` means the caller proceeds; `Duplicate`
    /// is an expected skip, not an error.
    pub async fn claim(
        &self,
        key: &str,
        original_key: &str,
    ) -> Result<ClaimOutcome, TransientStoreError> {
        match self.store.put_if_absent(key, original_key, self.ttl).await {
            Ok(outcome) => {
                if outcome == ClaimOutcome::Duplicate {
                    debug!(key = %original_key, "duplicate record dropped");
                }
                Ok(outcome)
            }
            Err(err) => Err(TransientStoreError(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_dedupes() {
        let store = InMemoryClaimStore::new();
        let ttl = StdDuration::from_secs(10);
        assert_eq!(
            store.put_if_absent("k", "orig", ttl).await.unwrap(),
            ClaimOutcome::New
        );
        assert_eq!(
            store.put_if_absent("k", "orig", ttl).await.unwrap(),
            ClaimOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn expired_claims_are_reclaimed() {
        let store = InMemoryClaimStore::new();
        store.inner.write().await.insert(
            "expired".into(),
            OffsetDateTime::now_utc() - Duration::seconds(5),
        );
        assert_eq!(
            store
                .put_if_absent("expired", "orig", StdDuration::from_secs(1))
                .await
                .unwrap(),
            ClaimOutcome::New
        );
    }

    #[tokio::test]
    async fn purge_drops_only_expired_entries() {
        let store = InMemoryClaimStore::new();
        let now = OffsetDateTime::now_utc();
        store
            .inner
            .write()
            .await
            .insert("old".into(), now - Duration::seconds(1));
        store
            .inner
            .write()
            .await
            .insert("live".into(), now + Duration::seconds(60));
        store.purge_expired(now).await;
        let guard = store.inner.read().await;
        assert!(!guard.contains_key("old"));
        assert!(guard.contains_key("live"));
    }

    #[tokio::test]
    async fn guard_reports_duplicates() {
        let store: SharedClaimStore = Arc::new(InMemoryClaimStore::new());
        let guard = IdempotencyGuard::new(store, StdDuration::from_secs(3600));
        assert_eq!(
            guard.claim("id-1", "a.bin").await.unwrap(),
            ClaimOutcome::New
        );
        assert_eq!(
            guard.claim("id-1", "a.bin").await.unwrap(),
            ClaimOutcome::Duplicate
        );
        assert_eq!(
            guard.claim("id-2", "b.bin").await.unwrap(),
            ClaimOutcome::New
        );
    }

    #[tokio::test]
    async fn guard_wraps_store_failures() {
        struct FailingStore;

        #[async_trait]
        impl ClaimStore for FailingStore {
            async fn put_if_absent(
                &self,
                _key: &str,
                _original_key: &str,
                _ttl: StdDuration,
            ) -> Result<ClaimOutcome> {
                anyhow::bail!("connection reset")
            }
        }

        let guard = IdempotencyGuard::new(Arc::new(FailingStore), StdDuration::from_secs(60));
        let err = guard.claim("id", "key").await.unwrap_err();
        assert!(err.to_string().contains("claim store unavailable"));
    }
}
