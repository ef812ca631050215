//! # Cache Module
//!
//! In-process caches with time-based expiry.
//!
//! - [`TtlCache`] - generic concurrent map with a fixed time-to-live
//! - [`SearchCache`] - search results keyed by provider hint and normalised
//!   query, so repeated autocomplete-style lookups skip the extractor
//!
//! Nothing here is shared between processes; a cold cache only costs one
//! extra resolver call.

pub mod ttl_cache;

use std::time::Duration;

use crate::model::{Track, TrackSource};

pub use ttl_cache::TtlCache;

pub const DEFAULT_SEARCH_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Distinct queries kept before the oldest is evicted.
pub const SEARCH_CACHE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct SearchCache {
    entries: TtlCache<String, Vec<Track>>,
}

impl Default for SearchCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_CACHE_TTL)
    }
}

impl SearchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: TtlCache::new(ttl, SEARCH_CACHE_CAPACITY),
        }
    }

    /// `"<hint>:<trimmed lowercase query>"`
    pub fn key(query: &str, source_hint: TrackSource) -> String {
        format!("{}:{}", source_hint, query.trim().to_lowercase())
    }

    pub fn get(&self, query: &str, source_hint: TrackSource) -> Option<Vec<Track>> {
        self.entries.get(&Self::key(query, source_hint))
    }

    pub fn insert(&self, query: &str, source_hint: TrackSource, results: Vec<Track>) {
        self.entries.insert(Self::key(query, source_hint), results);
    }

    pub fn cleanup_expired(&self) -> usize {
        self.entries.cleanup_expired()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalise_case_and_whitespace() {
        assert_eq!(
            SearchCache::key("  Lofi Beats ", TrackSource::YouTube),
            SearchCache::key("lofi beats", TrackSource::YouTube)
        );
        assert_ne!(
            SearchCache::key("lofi beats", TrackSource::YouTube),
            SearchCache::key("lofi beats", TrackSource::SoundCloud)
        );
        assert_eq!(SearchCache::key("X", TrackSource::Unknown), "unknown:x");
    }

    #[tokio::test(start_paused = true)]
    async fn results_live_for_the_ttl() {
        let cache = SearchCache::new(Duration::from_secs(60));
        let results = vec![Track {
            title: "hit".to_string(),
            ..Track::default()
        }];
        cache.insert("Query", TrackSource::YouTube, results.clone());

        assert_eq!(cache.get("query", TrackSource::YouTube), Some(results));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("query", TrackSource::YouTube), None);
    }

    #[test]
    fn distinct_queries_stay_bounded() {
        let cache = SearchCache::default();
        for n in 0..SEARCH_CACHE_CAPACITY + 50 {
            cache.insert(&format!("query {n}"), TrackSource::YouTube, Vec::new());
        }
        assert_eq!(cache.len(), SEARCH_CACHE_CAPACITY);
    }
}
