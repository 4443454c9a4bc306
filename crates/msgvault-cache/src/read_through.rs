//! Compute-once-under-lock read-through caching.

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    error::CacheError,
    slots::{BatchPolicy, CacheValue, KvCache, delete_cache_by_slot},
};

/// What a reader does when it loses the recompute race on a stale key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyPolicy {
    /// Wait briefly and retry until the winner has repopulated the key.
    #[default]
    WaitForFresh,
    /// Serve the tombstoned value immediately.
    ServeStale,
}

/// Read-through cache over a [`KvCache`].
///
/// A miss or tombstone takes a per-key recompute lock so exactly one
/// caller recomputes from the source of truth and repopulates the key;
/// everyone else either waits for the fresh value or serves the stale one,
/// per [`ConsistencyPolicy`]. Invalidation tombstones instead of deleting,
/// so a burst of invalidations never turns into a burst of recomputes.
#[derive(Clone)]
pub struct ReadThroughCache<C> {
    cache: C,
    policy: ConsistencyPolicy,
    lock_ttl: Duration,
    retry_wait: Duration,
    max_attempts: u32,
    batch: BatchPolicy,
}

impl<C: KvCache> ReadThroughCache<C> {
    /// Wrap a cache with the default policy (wait-for-fresh, 3 s lock TTL,
    /// 20 ms retry wait, 50 attempts).
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            policy: ConsistencyPolicy::default(),
            lock_ttl: Duration::from_secs(3),
            retry_wait: Duration::from_millis(20),
            max_attempts: 50,
            batch: BatchPolicy::default(),
        }
    }

    /// Use the given loser policy.
    pub fn with_policy(mut self, policy: ConsistencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The wrapped cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Serve `key` from cache, recomputing from `source` on miss or
    /// tombstone.
    ///
    /// `source` may be called at most once per invocation. If every
    /// attempt finds another caller holding the recompute lock, the value
    /// is computed directly and returned uncached; misses never fail a
    /// read that the source could answer.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        source: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let token = lock_token();
        let lock_key = format!("{key}:rt_lock");
        let mut source = Some(source);

        for _ in 0..self.max_attempts {
            let cached = self.cache.batch_get(std::slice::from_ref(&key.to_owned())).await?;
            match cached.into_iter().next().unwrap_or(CacheValue::Miss) {
                CacheValue::Fresh(raw) => return decode(&raw),
                CacheValue::Stale(raw) => {
                    if self.cache.try_lock(&lock_key, &token, self.lock_ttl).await? {
                        if let Some(source) = source.take() {
                            return self.recompute(key, &lock_key, &token, ttl, source).await;
                        }
                    } else if self.policy == ConsistencyPolicy::ServeStale {
                        debug!(key, "serving stale value while recompute is in flight");
                        return decode(&raw);
                    }
                },
                CacheValue::Miss => {
                    if self.cache.try_lock(&lock_key, &token, self.lock_ttl).await?
                        && let Some(source) = source.take()
                    {
                        return self.recompute(key, &lock_key, &token, ttl, source).await;
                    }
                },
            }
            tokio::time::sleep(self.retry_wait).await;
        }

        match source.take() {
            Some(source) => {
                warn!(key, "recompute lock contended past the retry budget, bypassing cache");
                source().await
            },
            None => Err(CacheError::Miss),
        }
    }

    async fn recompute<T, F, Fut>(
        &self,
        key: &str,
        lock_key: &str,
        token: &str,
        ttl: Duration,
        source: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let result = source().await;
        if let Ok(value) = &result {
            let mut raw = Vec::new();
            ciborium::into_writer(value, &mut raw)
                .map_err(|e| CacheError::Serialization(e.to_string()))?;
            self.cache.batch_set(&[(key.to_owned(), raw)], ttl).await?;
        }
        self.cache.unlock(lock_key, token).await?;
        result
    }

    /// Tombstone keys so the next readers recompute lazily.
    pub async fn invalidate(&self, keys: Vec<String>) -> Result<(), CacheError> {
        delete_cache_by_slot(&self.cache, keys, &self.batch).await
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CacheError> {
    ciborium::from_reader(raw).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn lock_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}
