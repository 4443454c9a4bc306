//! Advisory per-message cache.
//!
//! Holds recently written messages under `msg:{conversation}:{seq}` so
//! readers catching up on fresh seqs skip the document store. Purely
//! advisory: every miss falls through to the store, and eviction after a
//! durable write is best-effort.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use msgvault_model::{ConversationId, MessageRecord};

use crate::{
    error::CacheError,
    slots::{BatchPolicy, CacheValue, KvCache, process_keys_by_slot},
};

/// Per-message cache over a [`KvCache`].
#[derive(Clone)]
pub struct MessageCache<C> {
    cache: C,
    ttl: Duration,
    batch: BatchPolicy,
}

fn msg_key(conversation: &ConversationId, seq: i64) -> String {
    format!("msg:{conversation}:{seq}")
}

impl<C: KvCache> MessageCache<C> {
    /// Wrap a cache with the default 24 h entry TTL.
    pub fn new(cache: C) -> Self {
        Self::with_ttl(cache, Duration::from_secs(60 * 60 * 24))
    }

    /// Wrap a cache with an explicit entry TTL.
    pub fn with_ttl(cache: C, ttl: Duration) -> Self {
        Self { cache, ttl, batch: BatchPolicy::default() }
    }

    /// Cache a batch of messages under their seqs.
    pub async fn set_by_seqs(
        &self,
        conversation: &ConversationId,
        records: &[MessageRecord],
    ) -> Result<(), CacheError> {
        let mut by_key = HashMap::with_capacity(records.len());
        for record in records {
            let mut raw = Vec::new();
            ciborium::into_writer(record, &mut raw)
                .map_err(|e| CacheError::Serialization(e.to_string()))?;
            by_key.insert(msg_key(conversation, record.seq), raw);
        }
        let keys: Vec<String> = by_key.keys().cloned().collect();
        let by_key = Arc::new(by_key);

        let cache = self.cache.clone();
        let ttl = self.ttl;
        process_keys_by_slot(&self.cache, keys, &self.batch, move |batch| {
            let cache = cache.clone();
            let by_key = Arc::clone(&by_key);
            async move {
                let entries: Vec<(String, Vec<u8>)> = batch
                    .into_iter()
                    .filter_map(|key| {
                        let raw = by_key.get(&key).cloned();
                        raw.map(|raw| (key, raw))
                    })
                    .collect();
                cache.batch_set(&entries, ttl).await
            }
        })
        .await
    }

    /// Fetch cached messages for the given seqs.
    ///
    /// Returns the hits ordered by seq plus the seqs that must be read
    /// from the store. Tombstoned entries count as misses.
    pub async fn get_by_seqs(
        &self,
        conversation: &ConversationId,
        seqs: &[i64],
    ) -> Result<(Vec<MessageRecord>, Vec<i64>), CacheError> {
        let seq_by_key: HashMap<String, i64> =
            seqs.iter().map(|&seq| (msg_key(conversation, seq), seq)).collect();
        let keys: Vec<String> = seq_by_key.keys().cloned().collect();
        let seq_by_key = Arc::new(seq_by_key);

        let hits = Arc::new(Mutex::new(Vec::new()));
        let missed = Arc::new(Mutex::new(Vec::new()));

        let cache = self.cache.clone();
        let hit_sink = Arc::clone(&hits);
        let miss_sink = Arc::clone(&missed);
        process_keys_by_slot(&self.cache, keys, &self.batch, move |batch| {
            let cache = cache.clone();
            let seq_by_key = Arc::clone(&seq_by_key);
            let hit_sink = Arc::clone(&hit_sink);
            let miss_sink = Arc::clone(&miss_sink);
            async move {
                let values = cache.batch_get(&batch).await?;
                for (key, value) in batch.iter().zip(values) {
                    let Some(&seq) = seq_by_key.get(key) else { continue };
                    match value {
                        CacheValue::Fresh(raw) => {
                            let record: MessageRecord = ciborium::from_reader(raw.as_slice())
                                .map_err(|e| CacheError::Serialization(e.to_string()))?;
                            lock(&hit_sink).push(record);
                        },
                        CacheValue::Stale(_) | CacheValue::Miss => lock(&miss_sink).push(seq),
                    }
                }
                Ok(())
            }
        })
        .await?;

        let mut hits = std::mem::take(&mut *lock(&hits));
        hits.sort_unstable_by_key(|record| record.seq);
        let mut missed = std::mem::take(&mut *lock(&missed));
        missed.sort_unstable();
        Ok((hits, missed))
    }

    /// Evict the given seqs, slot by slot.
    pub async fn del_by_seqs(
        &self,
        conversation: &ConversationId,
        seqs: &[i64],
    ) -> Result<(), CacheError> {
        let keys: Vec<String> = seqs.iter().map(|&seq| msg_key(conversation, seq)).collect();
        let cache = self.cache.clone();
        process_keys_by_slot(&self.cache, keys, &self.batch, move |batch| {
            let cache = cache.clone();
            async move { cache.batch_delete(&batch).await }
        })
        .await
    }
}

fn lock<T>(shared: &Arc<Mutex<T>>) -> std::sync::MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::MemoryKv;

    fn record(seq: i64) -> MessageRecord {
        let mut record = MessageRecord::placeholder(seq);
        record.send_id = "u1".to_owned();
        record
    }

    #[tokio::test]
    async fn test_set_get_reports_misses() {
        let cache = MessageCache::new(MemoryKv::with_slots(4));
        let conversation = ConversationId::new("si_1_2");
        let records: Vec<MessageRecord> = (0..5).map(record).collect();
        cache.set_by_seqs(&conversation, &records).await.unwrap();

        let (hits, missed) =
            cache.get_by_seqs(&conversation, &[0, 2, 4, 6, 8]).await.unwrap();
        assert_eq!(hits.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(missed, vec![6, 8]);
    }

    #[tokio::test]
    async fn test_del_evicts() {
        let cache = MessageCache::new(MemoryKv::with_slots(4));
        let conversation = ConversationId::new("si_1_2");
        let records: Vec<MessageRecord> = (0..3).map(record).collect();
        cache.set_by_seqs(&conversation, &records).await.unwrap();

        cache.del_by_seqs(&conversation, &[0, 1]).await.unwrap();
        let (hits, missed) = cache.get_by_seqs(&conversation, &[0, 1, 2]).await.unwrap();
        assert_eq!(hits.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2]);
        assert_eq!(missed, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_messages_isolated_per_conversation() {
        let cache = MessageCache::new(MemoryKv::with_slots(4));
        let a = ConversationId::new("si_1_2");
        let b = ConversationId::new("si_3_4");
        cache.set_by_seqs(&a, &[record(0)]).await.unwrap();

        let (hits, missed) = cache.get_by_seqs(&b, &[0]).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(missed, vec![0]);
    }
}
