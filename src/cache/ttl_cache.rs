use dashmap::DashMap;
use std::{hash::Hash, time::Duration};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Concurrent map whose entries disappear after a fixed time-to-live.
/// Expired entries are dropped lazily on read or by [`cleanup_expired`].
/// Inserting a new key into a full cache first sweeps expired entries, then
/// evicts the entry closest to expiry.
///
/// [`cleanup_expired`]: TtlCache::cleanup_expired
#[derive(Debug)]
pub struct TtlCache<K: Eq + Hash, V> {
    data: DashMap<K, CacheEntry<V>>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            data: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&self, key: K, value: V) {
        if self.data.len() >= self.capacity
            && !self.data.contains_key(&key)
            && self.cleanup_expired() == 0
        {
            self.evict_oldest();
        }

        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.data.insert(key, entry);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.data.get(key) {
            if !entry.is_expired() {
                return Some(entry.value.clone());
            }
        }
        // re-checked under the write lock so a fresh insert is never dropped
        self.data.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .data
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.data.remove(&key);
            debug!("cache full, evicted oldest entry");
        }
    }

    /// Removes expired entries and returns how many went.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            debug!("cleaned {removed} expired cache entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(10), 16);
        cache.insert("k", 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get(&"k"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reinserting_resets_the_clock() {
        let cache = TtlCache::new(Duration::from_secs(10), 16);
        cache.insert("k", 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert("k", 2);
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_counts_removed_entries() {
        let cache = TtlCache::new(Duration::from_secs(5), 16);
        cache.insert(1, "a");
        cache.insert(2, "b");
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert(3, "c");

        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_the_oldest_entry() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("b", 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_prefers_dropping_expired_entries() {
        let cache = TtlCache::new(Duration::from_secs(5), 2);
        cache.insert("old", 1);
        tokio::time::advance(Duration::from_secs(4)).await;
        cache.insert("live", 2);
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.insert("new", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"live"), Some(2));
        assert_eq!(cache.get(&"new"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn overwriting_a_key_never_evicts() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("b", 3);

        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), Some(3));
    }
}
