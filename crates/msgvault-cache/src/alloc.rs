//! Cached sequence allocation.
//!
//! Sequence numbers come from a durable per-conversation counter
//! ([`SeqCounterStore`]), but the hot path must not hit it for every
//! message. The allocator keeps a cached window `[curr, last)` of
//! pre-reserved seqs and hands them out from cache; only when the window
//! is absent or exhausted does one worker take a short-lived lock, reserve
//! a new range (request size plus headroom) from the counter, and publish
//! the fresh window. The counter never decreases, so a crashed worker
//! leaks at most its headroom and never a duplicate.
//!
//! [`SeqWindowCache`] is the seam for the two cache-side operations, each
//! of which must execute atomically (a clustered rendition runs one
//! script per call). Correctness always defers to the durable counter:
//! whenever the cached window and the counter disagree, the counter wins.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use msgvault_model::{ConversationId, ConversationKind};
use msgvault_store::SeqCounterStore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::{AllocError, CacheError},
    read_through::ReadThroughCache,
    slots::{BatchPolicy, KvCache, Lock, MemoryKv, Window, process_keys_by_slot},
};

/// Outcome of one atomic window-advance attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MallocStep {
    /// The window covered the request; `[first, first + size)` is granted.
    Success {
        /// First granted seq. For `size == 0` this is the window's upper
        /// bound, the durable high-water mark.
        first: i64,
    },
    /// No window is cached. The fetch lock was written; the caller must
    /// reserve a range from the counter and commit it with `token`.
    NeedFetch {
        /// Lock token for the follow-up commit.
        token: String,
    },
    /// Another worker holds the fetch lock. Wait and retry.
    Locked,
    /// The window cannot cover the request. The fetch lock was written and
    /// the consumed cursor pinned to the upper bound; the caller must
    /// reserve a new range and commit it with `token`. The seqs
    /// `[curr, last)` are the window's unconsumed remainder and still
    /// belong to this caller.
    Exceeded {
        /// Consumed cursor before it was pinned.
        curr: i64,
        /// Cached upper bound, expected to equal the durable counter.
        last: i64,
        /// Lock token for the follow-up commit.
        token: String,
    },
}

/// Outcome of publishing a fresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The lock was still ours; the window was swapped in.
    Committed,
    /// No live state existed; the window was written from scratch. The
    /// reservation is durable, so the allocation stands.
    FreshWrite,
    /// A live window exists and `token` does not hold its lock; nothing
    /// was written. Logged and dropped, never an error: the durable
    /// reservation stands.
    LockStolen,
}

/// The two atomic cache operations sequence allocation needs.
///
/// Each method must be atomic with respect to the other and to itself (no
/// interleaving between its read and its write for one key).
#[async_trait]
pub trait SeqWindowCache: Clone + Send + Sync + 'static {
    /// Try to advance the cached window by `size`.
    ///
    /// `size == 0` is a read: it refreshes the data TTL and returns
    /// [`MallocStep::Success`] with the window's upper bound. On
    /// [`MallocStep::NeedFetch`] and [`MallocStep::Exceeded`] the fetch
    /// lock has been written with `lock_ttl`.
    async fn malloc_step(
        &self,
        key: &str,
        size: i64,
        lock_ttl: Duration,
        data_ttl: Duration,
    ) -> Result<MallocStep, CacheError>;

    /// Publish the window `[curr, last)`, releasing the fetch lock if
    /// `token` still owns it.
    async fn commit_window(
        &self,
        key: &str,
        token: &str,
        curr: i64,
        last: i64,
        ttl: Duration,
    ) -> Result<CommitOutcome, CacheError>;

    /// Read the cached upper bounds of many windows at once. Keys must
    /// share a hash slot. `None` for windows that are absent, expired, or
    /// not yet fetched.
    async fn window_bounds(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CacheError>;
}

#[async_trait]
impl SeqWindowCache for MemoryKv {
    async fn malloc_step(
        &self,
        key: &str,
        size: i64,
        lock_ttl: Duration,
        data_ttl: Duration,
    ) -> Result<MallocStep, CacheError> {
        let now = Instant::now();
        let mut inner = self.lock_inner();

        let live = inner.windows.get(key).is_some_and(|w| w.expires_at > now);
        if !live {
            let token = lock_token();
            inner.windows.insert(
                key.to_owned(),
                Window {
                    seqs: None,
                    lock: Some(Lock { token: token.clone(), expires_at: now + lock_ttl }),
                    expires_at: now + lock_ttl,
                },
            );
            return Ok(MallocStep::NeedFetch { token });
        }

        // Unwrap-free by construction: `live` proved presence above.
        let Some(window) = inner.windows.get_mut(key) else {
            return Err(CacheError::Io("window vanished under lock".to_owned()));
        };
        if window.lock.as_ref().is_some_and(|lock| lock.is_held(now)) {
            return Ok(MallocStep::Locked);
        }

        match window.seqs {
            None => {
                // The previous fetcher's lock expired without a commit.
                let token = lock_token();
                window.lock = Some(Lock { token: token.clone(), expires_at: now + lock_ttl });
                window.expires_at = window.expires_at.max(now + lock_ttl);
                Ok(MallocStep::NeedFetch { token })
            },
            Some((curr, last)) if size == 0 => {
                debug_assert!(curr <= last);
                window.expires_at = now + data_ttl;
                Ok(MallocStep::Success { first: last })
            },
            Some((curr, last)) if curr + size <= last => {
                window.seqs = Some((curr + size, last));
                window.expires_at = now + data_ttl;
                Ok(MallocStep::Success { first: curr })
            },
            Some((curr, last)) => {
                let token = lock_token();
                window.seqs = Some((last, last));
                window.lock = Some(Lock { token: token.clone(), expires_at: now + lock_ttl });
                window.expires_at = window.expires_at.max(now + lock_ttl);
                Ok(MallocStep::Exceeded { curr, last, token })
            },
        }
    }

    async fn commit_window(
        &self,
        key: &str,
        token: &str,
        curr: i64,
        last: i64,
        ttl: Duration,
    ) -> Result<CommitOutcome, CacheError> {
        let now = Instant::now();
        let mut inner = self.lock_inner();

        let fresh = Window { seqs: Some((curr, last)), lock: None, expires_at: now + ttl };
        match inner.windows.get_mut(key) {
            Some(window) if window.expires_at > now => match &window.lock {
                Some(lock) if lock.is_held(now) && lock.token == token => {
                    *window = fresh;
                    Ok(CommitOutcome::Committed)
                },
                // A live window without our lock means a successor already
                // recovered and published; overwriting would regress seqs
                // that were handed out from the newer range.
                _ => Ok(CommitOutcome::LockStolen),
            },
            _ => {
                inner.windows.insert(key.to_owned(), fresh);
                Ok(CommitOutcome::FreshWrite)
            },
        }
    }

    async fn window_bounds(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CacheError> {
        let now = Instant::now();
        let inner = self.lock_inner();
        Ok(keys
            .iter()
            .map(|key| match inner.windows.get(key) {
                Some(window) if window.expires_at > now => window.seqs.map(|(_, last)| last),
                _ => None,
            })
            .collect())
    }
}

fn lock_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn lock<T>(shared: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Extra seqs reserved beyond each request, per conversation kind.
///
/// Headroom trades counter round-trips against seqs leaked when a worker
/// dies holding an unconsumed window. One policy for all callers; mixing
/// policies across workers would make windows churn.
#[derive(Debug, Clone, Copy)]
pub struct Headroom {
    /// Headroom for direct conversations.
    pub direct: i64,
    /// Headroom for group conversations, larger because groups burst.
    pub group: i64,
}

impl Default for Headroom {
    fn default() -> Self {
        Self { direct: 50, group: 100 }
    }
}

impl Headroom {
    fn for_conversation(&self, conversation: &ConversationId) -> i64 {
        match conversation.kind() {
            ConversationKind::Direct => self.direct,
            ConversationKind::Group => self.group,
        }
    }
}

/// Tunables for [`SeqAllocator`].
#[derive(Debug, Clone)]
pub struct AllocConfig {
    /// Extra seqs reserved on each counter fetch.
    pub headroom: Headroom,
    /// Fetch-lock TTL; bounds how long a crashed fetcher can stall others.
    pub lock_ttl: Duration,
    /// Cached-window TTL, refreshed on every touch.
    pub data_ttl: Duration,
    /// Wait between attempts when the window is locked.
    pub retry_wait: Duration,
    /// Attempts before giving up with a timeout.
    pub max_attempts: u32,
    /// TTL of the cached retention floor.
    pub min_seq_ttl: Duration,
    /// Batching policy for multi-conversation cache reads.
    pub batch: BatchPolicy,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            headroom: Headroom::default(),
            lock_ttl: Duration::from_secs(3),
            data_ttl: Duration::from_secs(60 * 60 * 24),
            retry_wait: Duration::from_millis(250),
            max_attempts: 10,
            min_seq_ttl: Duration::from_secs(60 * 60),
            batch: BatchPolicy::default(),
        }
    }
}

/// Sequence allocator: cached window in front of the durable counter.
#[derive(Clone)]
pub struct SeqAllocator<C, S> {
    cache: C,
    counters: S,
    config: AllocConfig,
    read_through: ReadThroughCache<C>,
}

fn window_key(conversation: &ConversationId) -> String {
    format!("malloc_seq:{conversation}")
}

fn min_seq_key(conversation: &ConversationId) -> String {
    format!("min_seq:{conversation}")
}

impl<C, S> SeqAllocator<C, S>
where
    C: SeqWindowCache + KvCache,
    S: SeqCounterStore,
{
    /// Create an allocator over the given cache and counter backends.
    pub fn new(cache: C, counters: S, config: AllocConfig) -> Self {
        let read_through = ReadThroughCache::new(cache.clone());
        Self { cache, counters, config, read_through }
    }

    /// Reserve `size` contiguous seqs for a conversation; returns the
    /// first.
    ///
    /// `size == 0` reads the high-water mark without reserving. The union
    /// of all reservations is gap-free under any interleaving of callers.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidSize`] for negative sizes;
    /// [`AllocError::AllocationTimeout`] when every attempt found the
    /// window locked; counter-store failures surface immediately.
    pub async fn malloc(
        &self,
        conversation: &ConversationId,
        size: i64,
    ) -> Result<i64, AllocError> {
        if size < 0 {
            return Err(AllocError::InvalidSize(size));
        }
        let key = window_key(conversation);

        for attempt in 0..self.config.max_attempts {
            let step = self
                .cache
                .malloc_step(&key, size, self.config.lock_ttl, self.config.data_ttl)
                .await?;
            match step {
                MallocStep::Success { first } => return Ok(first),
                MallocStep::Locked => {
                    debug!(
                        conversation_id = %conversation,
                        attempt,
                        "allocation window locked, waiting"
                    );
                    tokio::time::sleep(self.config.retry_wait).await;
                },
                MallocStep::NeedFetch { token } => {
                    return self.refill(conversation, &key, &token, size, None).await;
                },
                MallocStep::Exceeded { curr, last, token } => {
                    return self.refill(conversation, &key, &token, size, Some((curr, last))).await;
                },
            }
        }
        Err(AllocError::AllocationTimeout)
    }

    /// Reserve a fresh range from the durable counter and publish it.
    ///
    /// When an exhausted window's bound agrees with the counter, the grant
    /// starts at the window's unconsumed remainder so no reserved seq is
    /// skipped; the remainder plus a slice of the fresh reservation covers
    /// the request.
    async fn refill(
        &self,
        conversation: &ConversationId,
        key: &str,
        token: &str,
        size: i64,
        cached: Option<(i64, i64)>,
    ) -> Result<i64, AllocError> {
        let headroom =
            if size == 0 { 0 } else { self.config.headroom.for_conversation(conversation) };
        let first = self.counters.malloc(conversation, size + headroom).await?;

        let granted = match cached {
            Some((curr, last)) if last == first => curr,
            Some((_, last)) => {
                // Someone reserved seqs without going through the cache.
                // The durable counter wins; the cached bound is discarded.
                warn!(
                    conversation_id = %conversation,
                    cached_last = last,
                    counter = first,
                    "cached window diverged from durable counter, re-deriving"
                );
                first
            },
            None => first,
        };

        let outcome = self
            .cache
            .commit_window(
                key,
                token,
                granted + size,
                first + size + headroom,
                self.config.data_ttl,
            )
            .await?;
        if outcome == CommitOutcome::LockStolen {
            warn!(
                conversation_id = %conversation,
                "window lock stolen before commit, reservation stands"
            );
        }
        Ok(granted)
    }

    /// High-water mark: the lowest seq never reserved.
    pub async fn get_max_seq(&self, conversation: &ConversationId) -> Result<i64, AllocError> {
        self.malloc(conversation, 0).await
    }

    /// High-water marks for many conversations.
    ///
    /// Cached windows are read in slot-local batches; only conversations
    /// without a live window fall back to the counter path.
    pub async fn get_max_seqs(
        &self,
        conversations: &[ConversationId],
    ) -> Result<HashMap<ConversationId, i64>, AllocError> {
        let by_key: Arc<HashMap<String, ConversationId>> =
            Arc::new(conversations.iter().map(|c| (window_key(c), c.clone())).collect());
        let keys: Vec<String> = by_key.keys().cloned().collect();
        let found: Arc<Mutex<HashMap<ConversationId, i64>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(conversations.len())));

        let cache = self.cache.clone();
        let lookup = Arc::clone(&by_key);
        let sink = Arc::clone(&found);
        process_keys_by_slot(&self.cache, keys, &self.config.batch, move |batch| {
            let cache = cache.clone();
            let lookup = Arc::clone(&lookup);
            let sink = Arc::clone(&sink);
            async move {
                let bounds = cache.window_bounds(&batch).await?;
                let mut sink = lock(&sink);
                for (key, bound) in batch.iter().zip(bounds) {
                    if let Some(last) = bound
                        && let Some(conversation) = lookup.get(key)
                    {
                        sink.insert(conversation.clone(), last);
                    }
                }
                Ok(())
            }
        })
        .await?;

        let mut out = std::mem::take(&mut *lock(&found));
        for conversation in conversations {
            if !out.contains_key(conversation) {
                out.insert(conversation.clone(), self.get_max_seq(conversation).await?);
            }
        }
        Ok(out)
    }

    /// Retention floor, read-through cached.
    pub async fn get_min_seq(&self, conversation: &ConversationId) -> Result<i64, AllocError> {
        let counters = self.counters.clone();
        let conversation = conversation.clone();
        let key = min_seq_key(&conversation);
        let floor = self
            .read_through
            .get_or_compute(&key, self.config.min_seq_ttl, move || async move {
                counters
                    .get_min(&conversation)
                    .await
                    .map_err(|e| CacheError::Io(e.to_string()))
            })
            .await?;
        Ok(floor)
    }

    /// Raise the retention floor: write-through, then invalidate.
    pub async fn set_min_seq(
        &self,
        conversation: &ConversationId,
        seq: i64,
    ) -> Result<(), AllocError> {
        self.counters.set_min(conversation, seq).await?;
        self.read_through.invalidate(vec![min_seq_key(conversation)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use msgvault_store::MemoryStores;

    use super::*;

    fn allocator(
        config: AllocConfig,
    ) -> (MemoryKv, MemoryStores, SeqAllocator<MemoryKv, MemoryStores>) {
        let cache = MemoryKv::new();
        let counters = MemoryStores::new();
        let allocator = SeqAllocator::new(cache.clone(), counters.clone(), config);
        (cache, counters, allocator)
    }

    #[tokio::test]
    async fn test_window_state_machine() {
        let cache = MemoryKv::new();
        let lock_ttl = Duration::from_secs(3);
        let data_ttl = Duration::from_secs(60);

        let step = cache.malloc_step("k", 5, lock_ttl, data_ttl).await.unwrap();
        let MallocStep::NeedFetch { token } = step else {
            panic!("expected NeedFetch, got {step:?}");
        };

        // Others are shut out while the fetch is in flight.
        assert_eq!(cache.malloc_step("k", 5, lock_ttl, data_ttl).await.unwrap(), MallocStep::Locked);

        // Wrong token cannot publish.
        let outcome = cache.commit_window("k", "intruder", 5, 55, data_ttl).await.unwrap();
        assert_eq!(outcome, CommitOutcome::LockStolen);

        let outcome = cache.commit_window("k", &token, 5, 55, data_ttl).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        // Window serves until exhausted, then pins curr to last.
        assert_eq!(
            cache.malloc_step("k", 50, lock_ttl, data_ttl).await.unwrap(),
            MallocStep::Success { first: 5 }
        );
        let step = cache.malloc_step("k", 1, lock_ttl, data_ttl).await.unwrap();
        let MallocStep::Exceeded { curr: 55, last: 55, token: _ } = step else {
            panic!("expected Exceeded at 55, got {step:?}");
        };
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_after_lock_expiry_is_fresh_write() {
        let cache = MemoryKv::new();
        let lock_ttl = Duration::from_secs(3);
        let data_ttl = Duration::from_secs(60);

        let step = cache.malloc_step("k", 5, lock_ttl, data_ttl).await.unwrap();
        let MallocStep::NeedFetch { token } = step else {
            panic!("expected NeedFetch, got {step:?}");
        };

        tokio::time::advance(Duration::from_secs(4)).await;
        let outcome = cache.commit_window("k", &token, 5, 55, data_ttl).await.unwrap();
        assert_eq!(outcome, CommitOutcome::FreshWrite);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_commit_cannot_roll_back_live_window() {
        let cache = MemoryKv::new();
        let lock_ttl = Duration::from_secs(3);
        let data_ttl = Duration::from_secs(60);

        // A fetcher takes the lock and stalls past its TTL.
        let step = cache.malloc_step("k", 5, lock_ttl, data_ttl).await.unwrap();
        let MallocStep::NeedFetch { token: stale } = step else {
            panic!("expected NeedFetch, got {step:?}");
        };
        tokio::time::advance(Duration::from_secs(4)).await;

        // A successor recovers, publishes a newer range and serves from it.
        let step = cache.malloc_step("k", 5, lock_ttl, data_ttl).await.unwrap();
        let MallocStep::NeedFetch { token } = step else {
            panic!("expected NeedFetch, got {step:?}");
        };
        assert_eq!(
            cache.commit_window("k", &token, 60, 110, data_ttl).await.unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(
            cache.malloc_step("k", 5, lock_ttl, data_ttl).await.unwrap(),
            MallocStep::Success { first: 60 }
        );

        // The stalled fetcher's late commit must not regress the window.
        assert_eq!(
            cache.commit_window("k", &stale, 5, 55, data_ttl).await.unwrap(),
            CommitOutcome::LockStolen
        );
        assert_eq!(
            cache.malloc_step("k", 5, lock_ttl, data_ttl).await.unwrap(),
            MallocStep::Success { first: 65 }
        );
    }

    #[tokio::test]
    async fn test_allocation_scenario() {
        // Group conversation: headroom 100.
        let (_, counters, allocator) = allocator(AllocConfig::default());
        let conversation = ConversationId::new("g_1");

        assert_eq!(allocator.malloc(&conversation, 30).await.unwrap(), 0);

        let mut firsts = Vec::new();
        for _ in 0..3 {
            firsts.push(allocator.malloc(&conversation, 50).await.unwrap());
        }
        firsts.sort_unstable();
        assert_eq!(firsts, vec![30, 80, 130]);

        // The third call exhausted the window and re-reserved 50 + 100.
        assert_eq!(counters.get_max(&conversation).await.unwrap(), 280);
        assert_eq!(allocator.get_max_seq(&conversation).await.unwrap(), 280);
    }

    #[tokio::test]
    async fn test_exceeded_request_gets_window_remainder() {
        let (_, counters, allocator) = allocator(AllocConfig::default());
        let conversation = ConversationId::new("si_1_2");

        assert_eq!(allocator.malloc(&conversation, 3).await.unwrap(), 0);
        assert_eq!(allocator.malloc(&conversation, 49).await.unwrap(), 3);

        // The window is [52, 53): a straddling request starts at the
        // remainder, not at the fresh counter value, so seq 52 is never
        // leaked.
        assert_eq!(allocator.malloc(&conversation, 2).await.unwrap(), 52);
        assert_eq!(allocator.malloc(&conversation, 1).await.unwrap(), 54);
        assert_eq!(counters.get_max(&conversation).await.unwrap(), 105);
    }

    #[tokio::test]
    async fn test_get_max_seqs_serves_cached_and_uncached() {
        let (_, counters, allocator) = allocator(AllocConfig::default());
        let warm = ConversationId::new("si_1_2");
        let cold = ConversationId::new("si_3_4");

        assert_eq!(allocator.malloc(&warm, 10).await.unwrap(), 0);

        let maxes = allocator.get_max_seqs(&[warm.clone(), cold.clone()]).await.unwrap();
        assert_eq!(maxes.get(&warm), Some(&60));
        assert_eq!(maxes.get(&cold), Some(&0));
        assert_eq!(counters.get_max(&cold).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_malloc_partitions_range() {
        let (_, counters, allocator) = allocator(AllocConfig::default());
        let conversation = ConversationId::new("si_1_2");

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..4i64 {
            let allocator = allocator.clone();
            let conversation = conversation.clone();
            tasks.spawn(async move {
                let mut ranges = Vec::new();
                for i in 0..25i64 {
                    let size = 1 + (worker + i) % 4;
                    let first = allocator.malloc(&conversation, size).await.unwrap();
                    ranges.push((first, size));
                }
                ranges
            });
        }

        let mut ranges = Vec::new();
        while let Some(worker_ranges) = tasks.join_next().await {
            ranges.extend(worker_ranges.unwrap());
        }

        // Reserved ranges partition [0, total) exactly.
        ranges.sort_unstable();
        let total: i64 = ranges.iter().map(|&(_, size)| size).sum();
        let mut next = 0;
        for (first, size) in ranges {
            assert_eq!(first, next);
            next = first + size;
        }
        assert_eq!(next, total);
        assert!(counters.get_max(&conversation).await.unwrap() >= total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_fetcher_delays_but_cannot_block() {
        let config = AllocConfig { lock_ttl: Duration::from_secs(1), ..AllocConfig::default() };
        let (cache, _, allocator) = allocator(config.clone());
        let conversation = ConversationId::new("si_1_2");

        // A fetcher takes the lock and dies without committing.
        let key = window_key(&conversation);
        let step =
            cache.malloc_step(&key, 5, config.lock_ttl, config.data_ttl).await.unwrap();
        assert!(matches!(step, MallocStep::NeedFetch { .. }));

        // The next caller waits out the lock TTL and then allocates.
        assert_eq!(allocator.malloc(&conversation, 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counter_divergence_defers_to_store() {
        let (_, counters, allocator) = allocator(AllocConfig::default());
        let conversation = ConversationId::new("si_1_2");

        // Window [10, 60) cached, counter at 60.
        assert_eq!(allocator.malloc(&conversation, 10).await.unwrap(), 0);
        assert_eq!(allocator.malloc(&conversation, 50).await.unwrap(), 10);

        // Seqs reserved behind the cache's back.
        counters.malloc(&conversation, 5).await.unwrap();

        // Exhaustion re-derives from the durable counter, not the cached
        // bound.
        assert_eq!(allocator.malloc(&conversation, 1).await.unwrap(), 65);
        assert_eq!(counters.get_max(&conversation).await.unwrap(), 116);
    }

    #[tokio::test]
    async fn test_min_seq_cached_and_invalidated() {
        let (_, counters, allocator) = allocator(AllocConfig::default());
        let conversation = ConversationId::new("si_1_2");

        assert_eq!(allocator.get_min_seq(&conversation).await.unwrap(), 0);

        // A write behind the cache's back is not seen...
        counters.set_min(&conversation, 5).await.unwrap();
        assert_eq!(allocator.get_min_seq(&conversation).await.unwrap(), 0);

        // ...but the write-through path invalidates and re-reads.
        allocator.set_min_seq(&conversation, 5).await.unwrap();
        assert_eq!(allocator.get_min_seq(&conversation).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_negative_size_rejected() {
        let (_, _, allocator) = allocator(AllocConfig::default());
        let conversation = ConversationId::new("si_1_2");
        assert!(matches!(
            allocator.malloc(&conversation, -3).await,
            Err(AllocError::InvalidSize(-3))
        ));
    }
}
