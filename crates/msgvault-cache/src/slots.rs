//! Hash-slot batch primitive.
//!
//! Clustered cache backends only allow multi-key commands when every key
//! hashes to the same slot. Everything here is built around that
//! constraint: [`KvCache`] exposes atomic batched operations whose keys
//! must share a slot, and [`process_keys_by_slot`] is the driver that
//! groups arbitrary key sets into slot-local batches and runs them with
//! bounded concurrency.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tracing::warn;

use crate::error::CacheError;

/// A cached value as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    /// Live value.
    Fresh(Vec<u8>),
    /// Tombstoned value: still readable, but a recompute is pending.
    Stale(Vec<u8>),
    /// Not cached.
    Miss,
}

/// Batched key-value cache with cluster-style slot semantics.
///
/// Every batch operation is atomic and its keys must share a hash slot
/// (use [`process_keys_by_slot`] for arbitrary key sets). Tombstoning via
/// [`tag_deleted`](Self::tag_deleted) marks values stale instead of
/// dropping them, so invalidation never produces a thundering recompute.
#[async_trait]
pub trait KvCache: Clone + Send + Sync + 'static {
    /// Hash slot of a key.
    fn key_slot(&self, key: &str) -> u32;

    /// Fetch many keys at once. One [`CacheValue`] per requested key, in
    /// order.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<CacheValue>, CacheError>;

    /// Write many entries at once with a shared TTL.
    async fn batch_set(
        &self,
        entries: &[(String, Vec<u8>)],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Drop many keys at once.
    async fn batch_delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Tombstone many keys at once. Missing keys are ignored.
    async fn tag_deleted(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Set-if-absent lock with TTL. Returns whether the lock was taken.
    ///
    /// A holder re-locking with its own token refreshes the TTL.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Release a lock if `token` still owns it. Releasing a lock that was
    /// lost or expired is a no-op.
    async fn unlock(&self, key: &str, token: &str) -> Result<(), CacheError>;
}

/// Batching policy for [`process_keys_by_slot`].
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Maximum keys per handler invocation.
    pub batch_size: usize,
    /// Maximum handler invocations in flight at once.
    pub concurrency: usize,
    /// Log-and-continue instead of aborting on the first handler error.
    pub continue_on_error: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self { batch_size: 50, concurrency: 3, continue_on_error: false }
    }
}

/// Run `handler` over `keys` grouped into slot-local batches.
///
/// Keys are grouped by [`KvCache::key_slot`], each group split into
/// batches of at most `policy.batch_size`, and batches run concurrently
/// under a semaphore of `policy.concurrency` permits. With
/// `continue_on_error` set, handler failures are logged and the remaining
/// batches still run; otherwise the first failure aborts the rest and is
/// returned.
pub async fn process_keys_by_slot<C, F, Fut>(
    cache: &C,
    keys: Vec<String>,
    policy: &BatchPolicy,
    handler: F,
) -> Result<(), CacheError>
where
    C: KvCache,
    F: Fn(Vec<String>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<(), CacheError>> + Send + 'static,
{
    let mut by_slot: HashMap<u32, Vec<String>> = HashMap::new();
    for key in keys {
        by_slot.entry(cache.key_slot(&key)).or_default().push(key);
    }

    let semaphore = Arc::new(Semaphore::new(policy.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for slot_keys in by_slot.into_values() {
        for batch in slot_keys.chunks(policy.batch_size.max(1)) {
            let batch = batch.to_vec();
            let handler = handler.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| CacheError::Io(e.to_string()))?;
                handler(batch).await
            });
        }
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                if policy.continue_on_error {
                    warn!(error = %e, "slot batch failed, continuing");
                } else if first_error.is_none() {
                    first_error = Some(e);
                    tasks.abort_all();
                }
            },
            Err(e) if e.is_cancelled() => {},
            Err(e) => return Err(CacheError::Io(e.to_string())),
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Tombstone an arbitrary key set, slot by slot.
pub async fn delete_cache_by_slot<C: KvCache>(
    cache: &C,
    keys: Vec<String>,
    policy: &BatchPolicy,
) -> Result<(), CacheError> {
    let tagger = cache.clone();
    process_keys_by_slot(cache, keys, policy, move |batch| {
        let tagger = tagger.clone();
        async move { tagger.tag_deleted(&batch).await }
    })
    .await
}

/// In-process [`KvCache`] used by tests and the demo binary.
///
/// One mutex over all state; slot assignment is a deterministic byte sum,
/// so slot-related behavior is reproducible. Expiry uses the tokio clock
/// and is checked lazily on access.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
    slot_count: u32,
}

#[derive(Default)]
pub(crate) struct Inner {
    pub(crate) entries: HashMap<String, Entry>,
    pub(crate) locks: HashMap<String, Lock>,
    pub(crate) windows: HashMap<String, Window>,
}

pub(crate) struct Entry {
    pub(crate) value: Vec<u8>,
    pub(crate) expires_at: Instant,
    pub(crate) stale: bool,
}

pub(crate) struct Lock {
    pub(crate) token: String,
    pub(crate) expires_at: Instant,
}

impl Lock {
    pub(crate) fn is_held(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Cached sequence-allocation window state (see the `alloc` module).
pub(crate) struct Window {
    /// `(curr, last)` once a window has been fetched; `None` while only
    /// the fetch lock exists.
    pub(crate) seqs: Option<(i64, i64)>,
    pub(crate) lock: Option<Lock>,
    pub(crate) expires_at: Instant,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Create a cache with the default slot count.
    pub fn new() -> Self {
        Self::with_slots(16)
    }

    /// Create a cache hashing keys into `slot_count` slots.
    pub fn with_slots(slot_count: u32) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), slot_count: slot_count.max(1) }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvCache for MemoryKv {
    fn key_slot(&self, key: &str) -> u32 {
        let sum: u32 = key.bytes().map(u32::from).fold(0, u32::wrapping_add);
        sum % self.slot_count
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<CacheValue>, CacheError> {
        let now = Instant::now();
        let inner = self.lock_inner();
        Ok(keys
            .iter()
            .map(|key| match inner.entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    if entry.stale {
                        CacheValue::Stale(entry.value.clone())
                    } else {
                        CacheValue::Fresh(entry.value.clone())
                    }
                },
                _ => CacheValue::Miss,
            })
            .collect())
    }

    async fn batch_set(
        &self,
        entries: &[(String, Vec<u8>)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        let mut inner = self.lock_inner();
        for (key, value) in entries {
            inner.entries.insert(
                key.clone(),
                Entry { value: value.clone(), expires_at, stale: false },
            );
        }
        Ok(())
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut inner = self.lock_inner();
        for key in keys {
            inner.entries.remove(key);
        }
        Ok(())
    }

    async fn tag_deleted(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut inner = self.lock_inner();
        for key in keys {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.stale = true;
            }
        }
        Ok(())
    }

    async fn try_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        match inner.locks.get(key) {
            Some(lock) if lock.is_held(now) && lock.token != token => Ok(false),
            _ => {
                inner.locks.insert(
                    key.to_owned(),
                    Lock { token: token.to_owned(), expires_at: now + ttl },
                );
                Ok(true)
            },
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<(), CacheError> {
        let mut inner = self.lock_inner();
        if inner.locks.get(key).is_some_and(|lock| lock.token == token) {
            inner.locks.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn keys(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|&k| k.to_owned()).collect()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryKv::new();
        let entries = vec![("a".to_owned(), vec![1]), ("b".to_owned(), vec![2])];
        cache.batch_set(&entries, Duration::from_secs(60)).await.unwrap();

        let got = cache.batch_get(&keys(&["a", "b", "c"])).await.unwrap();
        assert_eq!(got[0], CacheValue::Fresh(vec![1]));
        assert_eq!(got[1], CacheValue::Fresh(vec![2]));
        assert_eq!(got[2], CacheValue::Miss);

        cache.batch_delete(&keys(&["a"])).await.unwrap();
        let got = cache.batch_get(&keys(&["a"])).await.unwrap();
        assert_eq!(got[0], CacheValue::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryKv::new();
        let entries = vec![("a".to_owned(), vec![1])];
        cache.batch_set(&entries, Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let got = cache.batch_get(&keys(&["a"])).await.unwrap();
        assert_eq!(got[0], CacheValue::Miss);
    }

    #[tokio::test]
    async fn test_tag_deleted_serves_stale() {
        let cache = MemoryKv::new();
        let entries = vec![("a".to_owned(), vec![1])];
        cache.batch_set(&entries, Duration::from_secs(60)).await.unwrap();

        cache.tag_deleted(&keys(&["a", "missing"])).await.unwrap();
        let got = cache.batch_get(&keys(&["a"])).await.unwrap();
        assert_eq!(got[0], CacheValue::Stale(vec![1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_excludes_and_expires() {
        let cache = MemoryKv::new();
        let ttl = Duration::from_secs(5);

        assert!(cache.try_lock("k", "t1", ttl).await.unwrap());
        assert!(!cache.try_lock("k", "t2", ttl).await.unwrap());
        // The holder refreshes its own lock.
        assert!(cache.try_lock("k", "t1", ttl).await.unwrap());

        // A stale unlock from a non-owner is a no-op.
        cache.unlock("k", "t2").await.unwrap();
        assert!(!cache.try_lock("k", "t2", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.try_lock("k", "t2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_process_keys_by_slot_visits_every_key() {
        let cache = MemoryKv::with_slots(4);
        let all: Vec<String> = (0..137).map(|i| format!("key:{i}")).collect();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let slot_cache = cache.clone();
        process_keys_by_slot(
            &cache,
            all.clone(),
            &BatchPolicy { batch_size: 10, concurrency: 2, continue_on_error: false },
            move |batch| {
                let sink = Arc::clone(&sink);
                let slot_cache = slot_cache.clone();
                async move {
                    // Every batch must be slot-homogeneous.
                    let slots: Vec<u32> =
                        batch.iter().map(|k| slot_cache.key_slot(k)).collect();
                    assert!(slots.windows(2).all(|w| w[0] == w[1]));
                    sink.lock().unwrap().extend(batch);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        let mut expected = all;
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_process_keys_continue_on_error() {
        let cache = MemoryKv::with_slots(4);
        let all: Vec<String> = (0..20).map(|i| format!("key:{i}")).collect();
        let processed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&processed);
        let result = process_keys_by_slot(
            &cache,
            all,
            &BatchPolicy { batch_size: 1, concurrency: 1, continue_on_error: true },
            move |batch| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(batch.len(), Ordering::SeqCst);
                    if batch[0] == "key:7" {
                        return Err(CacheError::Io("injected".to_owned()));
                    }
                    Ok(())
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(processed.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_process_keys_aborts_on_error() {
        let cache = MemoryKv::with_slots(1);
        let all: Vec<String> = (0..5).map(|i| format!("key:{i}")).collect();

        let result = process_keys_by_slot(
            &cache,
            all,
            &BatchPolicy { batch_size: 1, concurrency: 1, continue_on_error: false },
            move |batch| async move {
                if batch[0] == "key:0" {
                    return Err(CacheError::Io("injected".to_owned()));
                }
                Ok(())
            },
        )
        .await;

        assert_eq!(result, Err(CacheError::Io("injected".to_owned())));
    }

    #[tokio::test]
    async fn test_delete_cache_by_slot_tombstones() {
        let cache = MemoryKv::with_slots(4);
        let entries: Vec<(String, Vec<u8>)> =
            (0..10).map(|i| (format!("key:{i}"), vec![i as u8])).collect();
        cache.batch_set(&entries, Duration::from_secs(60)).await.unwrap();

        let all: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        delete_cache_by_slot(&cache, all.clone(), &BatchPolicy::default()).await.unwrap();

        for value in cache.batch_get(&all).await.unwrap() {
            assert!(matches!(value, CacheValue::Stale(_)));
        }
    }
}
