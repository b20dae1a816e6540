//! Per-reference row cache for database sources. An entry only serves the
//! run that filled it, and expires after a TTL regardless.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

struct CacheEntry {
    data: Value,
    run_id: u64,
    inserted_at: Instant,
}

pub struct RowCache {
    store: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl RowCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Cached rows for `reference` in run `run_id`, or `None` if expired,
    /// filled by another run or missing.
    pub fn get(&self, reference: &str, run_id: u64) -> Option<Value> {
        let entry = self.store.get(reference)?;
        if entry.run_id != run_id || entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(reference);
            return None;
        }
        Some(entry.data.clone())
    }

    pub fn put(&self, reference: String, run_id: u64, data: Value) {
        if self.store.len() >= self.max_entries && !self.store.contains_key(&reference) {
            self.evict_expired();
            if self.store.len() >= self.max_entries {
                return;
            }
        }
        self.store.insert(
            reference,
            CacheEntry {
                data,
                run_id,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - self.store.len()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for RowCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 10_000)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get() {
        let cache = RowCache::default();
        cache.put("A1".into(), 1, json!([{"crp": 12}]));
        assert_eq!(cache.get("A1", 1), Some(json!([{"crp": 12}])));
        assert!(cache.get("A2", 1).is_none());
    }

    #[test]
    fn test_entries_only_serve_their_run() {
        let cache = RowCache::default();
        cache.put("A1".into(), 1, json!({"crp": 12}));
        assert!(cache.get("A1", 2).is_none());
        assert!(cache.is_empty());

        cache.put("A1".into(), 2, json!({"crp": 40}));
        assert_eq!(cache.get("A1", 2), Some(json!({"crp": 40})));
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = RowCache::new(Duration::ZERO, 10);
        cache.put("A1".into(), 1, json!({"crp": 12}));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("A1", 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_is_respected() {
        let cache = RowCache::new(Duration::from_secs(60), 1);
        cache.put("A1".into(), 1, json!(1));
        cache.put("A2".into(), 1, json!(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("A2", 1).is_none());
    }
}
