//! TTL cache: a keyed store with per-entry expiry, used to avoid re-resolving
//! USync lookups and re-deriving Signal addresses on every relay.
//!
//! Grounded on the `Arc<RwLock<HashMap<..>>>` idiom the teacher uses for
//! shared mutable state (`messaging::MessageStatusTracker`,
//! `connection::rate_limit::RateLimiter`).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// An async TTL cache. Expired entries are evicted lazily, on access.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    refresh_on_access: bool,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl, refresh_on_access: false }
    }

    /// Renew an entry's TTL whenever it's read, instead of only on insert.
    pub fn with_refresh_on_access(mut self, refresh: bool) -> Self {
        self.refresh_on_access = refresh;
        self
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        if self.refresh_on_access {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(key)?;
            if entry.expires_at <= Instant::now() {
                entries.remove(key);
                return None;
            }
            entry.expires_at = Instant::now() + self.ttl;
            return Some(entry.value.clone());
        }

        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            _ => None,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.insert(key, Entry { value, expires_at: Instant::now() + self.ttl });
    }

    pub async fn remove(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drop every entry whose TTL has elapsed. Callers can run this
    /// periodically; it is never required for correctness since `get` also
    /// checks expiry.
    pub async fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.write().await.retain(|_, entry| entry.expires_at > now);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub type SharedTtlCache<K, V> = Arc<TtlCache<K, V>>;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn inserts_and_reads_back() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn expires_entries_after_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("a", 1).await;
        sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&"a").await, None);
    }

    #[tokio::test]
    async fn refresh_on_access_extends_ttl() {
        let cache: TtlCache<&str, u32> =
            TtlCache::new(Duration::from_millis(40)).with_refresh_on_access(true);
        cache.insert("a", 1).await;
        sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.get(&"a").await, Some(1));
        sleep(Duration::from_millis(25)).await;
        // still alive: the read above pushed expiry forward
        assert_eq!(cache.get(&"a").await, Some(1));
    }

    #[tokio::test]
    async fn evict_expired_removes_stale_entries() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(10));
        cache.insert("a", 1).await;
        sleep(Duration::from_millis(20)).await;
        cache.evict_expired().await;
        assert_eq!(cache.len().await, 0);
    }
}
