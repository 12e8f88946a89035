//! In-process credit backend.
//!
//! Buckets live in a [`DashMap`]. The entry API holds the shard lock for the
//! duration of a hit, which makes each check-and-decrement atomic for every
//! task in this process. Suitable for single-instance deployments and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{precheck, BackendError, CreditBackend, CreditStatus};
use super::bucket::{BucketKey, DEFAULT_KEY_PREFIX};
use super::rules::Operation;

/// A single credit bucket.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    credit: i64,
    expires_at: Instant,
}

impl Bucket {
    fn fresh(credit_limit: i64, expires_at: Instant) -> Self {
        Self {
            credit: credit_limit - 1,
            expires_at,
        }
    }

    /// Remaining lifetime in whole seconds, rounded to nearest.
    fn ttl_seconds(&self, now: Instant) -> i64 {
        let remaining = self.expires_at.saturating_duration_since(now);
        ((remaining.as_millis() + 500) / 1000) as i64
    }
}

/// Credit backend that keeps buckets in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: DashMap<String, Bucket>,
    initialized: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop buckets whose interval has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
        let purged = before.saturating_sub(self.buckets.len());
        if purged > 0 {
            debug!(purged, "Purged expired buckets");
        }
        purged
    }

    /// Get the current credit for a bucket, if it exists and has not expired.
    pub fn credit(&self, key: &BucketKey) -> Option<i64> {
        let now = Instant::now();
        self.buckets
            .get(&key.to_store_key(DEFAULT_KEY_PREFIX))
            .filter(|b| b.expires_at > now)
            .map(|b| b.credit)
    }

    /// Get the number of live and not-yet-purged buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[async_trait]
impl CreditBackend for MemoryBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        self.initialized.store(true, Ordering::SeqCst);
        debug!("Memory backend initialized");
        Ok(())
    }

    async fn hit(
        &self,
        rule_operation: &Operation,
        actor: &str,
        credit_limit: i64,
        reset_seconds: i64,
    ) -> Result<CreditStatus, BackendError> {
        if let Some(status) = precheck(
            self.initialized.load(Ordering::SeqCst),
            credit_limit,
            reset_seconds,
        )? {
            return Ok(status);
        }

        let key = BucketKey::new(rule_operation, actor, credit_limit, reset_seconds);
        let now = Instant::now();
        let expires_at = now
            .checked_add(Duration::from_secs(reset_seconds as u64))
            .ok_or(BackendError::InvalidResetSeconds(reset_seconds))?;

        let status = match self.buckets.entry(key.to_store_key(DEFAULT_KEY_PREFIX)) {
            Entry::Occupied(mut entry) if entry.get().expires_at > now => {
                let bucket = entry.get_mut();
                let is_allowed = bucket.credit > 0;
                if is_allowed {
                    bucket.credit -= 1;
                }
                CreditStatus {
                    is_allowed,
                    current_credit: bucket.credit,
                    next_reset_seconds: bucket.ttl_seconds(now),
                }
            }
            Entry::Occupied(mut entry) => {
                let bucket = Bucket::fresh(credit_limit, expires_at);
                entry.insert(bucket);
                CreditStatus {
                    is_allowed: true,
                    current_credit: bucket.credit,
                    next_reset_seconds: reset_seconds,
                }
            }
            Entry::Vacant(entry) => {
                let bucket = Bucket::fresh(credit_limit, expires_at);
                entry.insert(bucket);
                CreditStatus {
                    is_allowed: true,
                    current_credit: bucket.credit,
                    next_reset_seconds: reset_seconds,
                }
            }
        };

        trace!(
            key = %key,
            allowed = status.is_allowed,
            credit = status.current_credit,
            "Bucket hit"
        );

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MAX_RESET_SECONDS;
    use std::sync::Arc;

    fn op(pairs: &[(&str, &str)]) -> Operation {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn ready_backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_hit_before_initialize_fails() {
        let backend = MemoryBackend::new();
        let result = backend.hit(&Operation::new(), "", 10, 60).await;
        assert!(matches!(result, Err(BackendError::NotInitialized)));
    }

    #[test]
    fn test_credit_lookup_without_runtime() {
        let backend = MemoryBackend::new();
        let operation = op(&[("path", "/ping")]);
        let key = BucketKey::new(&operation, "", 3, 60);
        assert_eq!(backend.credit(&key), None);

        tokio_test::block_on(backend.initialize()).unwrap();
        let status = tokio_test::block_on(backend.hit(&operation, "", 3, 60)).unwrap();
        assert!(status.is_allowed);
        assert_eq!(backend.credit(&key), Some(2));
    }

    #[tokio::test]
    async fn test_hit_rejects_bad_reset_seconds() {
        let backend = ready_backend().await;
        let result = backend.hit(&Operation::new(), "", 10, 0).await;
        assert!(matches!(result, Err(BackendError::InvalidResetSeconds(0))));
    }

    #[tokio::test]
    async fn test_hit_rejects_oversized_reset_seconds() {
        let backend = ready_backend().await;
        let result = backend.hit(&Operation::new(), "", 1, i64::MAX).await;
        assert!(matches!(
            result,
            Err(BackendError::InvalidResetSeconds(i64::MAX))
        ));
        assert_eq!(backend.bucket_count(), 0);

        let status = backend
            .hit(&Operation::new(), "", 1, MAX_RESET_SECONDS)
            .await
            .unwrap();
        assert!(status.is_allowed);
        assert_eq!(status.next_reset_seconds, MAX_RESET_SECONDS);
    }

    #[tokio::test]
    async fn test_zero_credit_never_touches_store() {
        let backend = ready_backend().await;
        for _ in 0..3 {
            let status = backend.hit(&op(&[("a", "1")]), "me", 0, 60).await.unwrap();
            assert_eq!(status, CreditStatus::no_credit());
        }
        assert_eq!(backend.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_hit_consumes_credit() {
        let backend = ready_backend().await;
        let operation = op(&[("method", "GET")]);

        let first = backend.hit(&operation, "actor", 3, 60).await.unwrap();
        assert_eq!(
            first,
            CreditStatus {
                is_allowed: true,
                current_credit: 2,
                next_reset_seconds: 60,
            }
        );

        let second = backend.hit(&operation, "actor", 3, 60).await.unwrap();
        assert!(second.is_allowed);
        assert_eq!(second.current_credit, 1);
        assert!(second.next_reset_seconds <= 60 && second.next_reset_seconds >= 59);

        let third = backend.hit(&operation, "actor", 3, 60).await.unwrap();
        assert!(third.is_allowed);
        assert_eq!(third.current_credit, 0);

        let fourth = backend.hit(&operation, "actor", 3, 60).await.unwrap();
        assert!(!fourth.is_allowed);
        assert_eq!(fourth.current_credit, 0);

        let key = BucketKey::new(&operation, "actor", 3, 60);
        assert_eq!(backend.credit(&key), Some(0));
    }

    #[tokio::test]
    async fn test_actors_have_separate_buckets() {
        let backend = ready_backend().await;
        let operation = op(&[("method", "GET")]);

        assert!(backend.hit(&operation, "alice", 1, 60).await.unwrap().is_allowed);
        assert!(!backend.hit(&operation, "alice", 1, 60).await.unwrap().is_allowed);
        assert!(backend.hit(&operation, "bob", 1, 60).await.unwrap().is_allowed);
        assert_eq!(backend.bucket_count(), 2);
    }

    #[tokio::test]
    async fn test_limit_change_starts_fresh_bucket() {
        let backend = ready_backend().await;
        let operation = op(&[("method", "GET")]);

        assert!(backend.hit(&operation, "", 1, 60).await.unwrap().is_allowed);
        assert!(!backend.hit(&operation, "", 1, 60).await.unwrap().is_allowed);
        assert!(backend.hit(&operation, "", 2, 60).await.unwrap().is_allowed);
        assert!(backend.hit(&operation, "", 1, 30).await.unwrap().is_allowed);
    }

    #[tokio::test]
    async fn test_bucket_resets_after_interval() {
        let backend = ready_backend().await;
        let operation = op(&[("method", "GET")]);

        assert!(backend.hit(&operation, "", 1, 1).await.unwrap().is_allowed);
        assert!(!backend.hit(&operation, "", 1, 1).await.unwrap().is_allowed);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let status = backend.hit(&operation, "", 1, 1).await.unwrap();
        assert!(status.is_allowed);
        assert_eq!(status.current_credit, 0);
        assert_eq!(status.next_reset_seconds, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let backend = ready_backend().await;
        backend.hit(&op(&[("a", "1")]), "", 5, 1).await.unwrap();
        backend.hit(&op(&[("a", "2")]), "", 5, 60).await.unwrap();
        assert_eq!(backend.purge_expired(), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.bucket_count(), 1);

        backend.clear();
        assert_eq!(backend.bucket_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits_never_oversell() {
        let backend = Arc::new(ready_backend().await);
        let operation = Arc::new(op(&[("method", "POST")]));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let backend = backend.clone();
                let operation = operation.clone();
                tokio::spawn(async move { backend.hit(&operation, "", 50, 60).await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap().is_allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
    }
}
