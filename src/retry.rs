//! Message retry manager (spec.md §4.8, optional component): caches the last
//! N sent messages keyed by `(destination, msgId)`, bounded by a configurable
//! retry count, so an incoming retry receipt can be answered by
//! re-encrypting the original payload rather than failing the resend.
//!
//! Grounded on the teacher's `messaging::MessageQueue`/`PendingMessage`,
//! generalized from a FIFO pending-send queue to a retry-count-bounded
//! lookup cache keyed the way spec.md requires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

/// One cached outbound send, available for re-encryption on retry receipt.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub plaintext: Vec<u8>,
    pub sent_at: SystemTime,
    pub retry_count: u8,
}

/// Caches the last `max_retry_count` sends per `(destination, msgId)` key.
/// Entries beyond that count for the same destination are evicted oldest
/// first; this mirrors `maxMsgRetryCount` from the configuration surface.
pub struct MessageRetryCache {
    max_retry_count: usize,
    entries: RwLock<HashMap<(String, String), CachedMessage>>,
    order: RwLock<Vec<(String, String)>>,
}

impl MessageRetryCache {
    pub fn new(max_retry_count: usize) -> Arc<Self> {
        Arc::new(Self {
            max_retry_count,
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        })
    }

    /// Record a freshly sent message. If the cache is already holding
    /// `max_retry_count` entries, the oldest is dropped.
    pub async fn record(&self, destination: &str, msg_id: &str, plaintext: Vec<u8>) {
        let key = (destination.to_string(), msg_id.to_string());
        let mut entries = self.entries.write().await;
        let mut order = self.order.write().await;

        if !entries.contains_key(&key) {
            order.push(key.clone());
            while order.len() > self.max_retry_count {
                let oldest = order.remove(0);
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CachedMessage { plaintext, sent_at: SystemTime::now(), retry_count: 0 },
        );
    }

    /// Look up a cached send for re-encryption, bumping its retry count.
    /// Returns `None` if the message was never cached or has aged out.
    pub async fn take_for_retry(&self, destination: &str, msg_id: &str) -> Option<CachedMessage> {
        let key = (destination.to_string(), msg_id.to_string());
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&key)?;
        entry.retry_count += 1;
        Some(entry.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_retrieves_by_destination_and_id() {
        let cache = MessageRetryCache::new(5);
        cache.record("555@s.whatsapp.net", "abc", b"hello".to_vec()).await;
        let cached = cache.take_for_retry("555@s.whatsapp.net", "abc").await.unwrap();
        assert_eq!(cached.plaintext, b"hello");
        assert_eq!(cached.retry_count, 1);
    }

    #[tokio::test]
    async fn missing_entry_returns_none() {
        let cache = MessageRetryCache::new(5);
        assert!(cache.take_for_retry("555@s.whatsapp.net", "missing").await.is_none());
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_retry_count() {
        let cache = MessageRetryCache::new(2);
        cache.record("d", "1", b"a".to_vec()).await;
        cache.record("d", "2", b"b".to_vec()).await;
        cache.record("d", "3", b"c".to_vec()).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.take_for_retry("d", "1").await.is_none());
        assert!(cache.take_for_retry("d", "3").await.is_some());
    }

    #[tokio::test]
    async fn repeat_retry_bumps_count_each_time() {
        let cache = MessageRetryCache::new(5);
        cache.record("d", "1", b"a".to_vec()).await;
        cache.take_for_retry("d", "1").await.unwrap();
        let second = cache.take_for_retry("d", "1").await.unwrap();
        assert_eq!(second.retry_count, 2);
    }
}
