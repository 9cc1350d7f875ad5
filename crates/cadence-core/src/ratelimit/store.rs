//! Bucket stores
//!
//! A bucket store owns every [`BucketState`] and performs the
//! refill-and-consume step atomically per key. Two implementations exist: the
//! in-process [`LocalBucketStore`] below and the Redis-backed store in
//! [`super::redis_store`] for deployments with several instances.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::bucket::{take_token, BucketOutcome, BucketState};
use super::policy::RateLimitPolicy;
use crate::error::CoreResult;

/// Storage for token buckets
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill the bucket for `key` and try to consume one token.
    ///
    /// Concurrent calls for the same key must never observe the same
    /// pre-consumption token count.
    async fn consume(&self, key: &str, policy: &RateLimitPolicy, now: f64) -> CoreResult<BucketOutcome>;

    /// Remove buckets not written since `cutoff` (Unix seconds); returns how many
    /// were removed
    async fn sweep(&self, cutoff: f64) -> CoreResult<usize>;

    /// Name of the backend, for logs and health output
    fn backend(&self) -> &'static str;

    /// Health check
    async fn health_check(&self) -> CoreResult<bool> {
        Ok(true)
    }
}

/// Single-process bucket store guarded by one mutex
#[derive(Debug, Default)]
pub struct LocalBucketStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl LocalBucketStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked buckets
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Whether no bucket is tracked
    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }

    /// Snapshot of a bucket
    pub fn get(&self, key: &str) -> Option<BucketState> {
        self.buckets.lock().get(key).copied()
    }
}

#[async_trait]
impl BucketStore for LocalBucketStore {
    async fn consume(&self, key: &str, policy: &RateLimitPolicy, now: f64) -> CoreResult<BucketOutcome> {
        let mut buckets = self.buckets.lock();

        let (next, outcome) = take_token(buckets.get(key).copied(), policy, now);
        if let Some(next) = next {
            buckets.insert(key.to_string(), next);
        }

        Ok(outcome)
    }

    async fn sweep(&self, cutoff: f64) -> CoreResult<usize> {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, state| state.last_update >= cutoff);
        let removed = before - buckets.len();

        if removed > 0 {
            debug!("Swept {} idle rate limit buckets", removed);
        }
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_store_tracks_keys_independently() {
        let store = LocalBucketStore::new();
        let policy = RateLimitPolicy::new(2, 60);

        assert!(store.consume("a", &policy, 0.0).await.unwrap().allowed);
        assert!(store.consume("a", &policy, 0.0).await.unwrap().allowed);
        assert!(!store.consume("a", &policy, 0.0).await.unwrap().allowed);

        assert!(store.consume("b", &policy, 0.0).await.unwrap().allowed);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_buckets() {
        let store = LocalBucketStore::new();
        let policy = RateLimitPolicy::new(10, 60);

        store.consume("old", &policy, 100.0).await.unwrap();
        store.consume("fresh", &policy, 5_000.0).await.unwrap();

        let removed = store.sweep(1_000.0).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }
}
