//! In-process TTL cache backed by DashMap for lock-free concurrent access.
//! Serves as L1 in front of Redis, or as the only tier when Redis is absent.

use crate::error::CacheResult;
use crate::kv::Cache;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

pub struct LocalCache {
    store: Arc<DashMap<String, CacheEntry>>,
    max_ttl: Option<Duration>,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            max_ttl: None,
            max_entries,
        }
    }

    /// Entries never outlive `max_ttl`, whatever TTL the caller asks for.
    pub fn with_max_ttl(max_ttl: Duration, max_entries: usize) -> Self {
        Self {
            max_ttl: Some(max_ttl),
            ..Self::new(max_entries)
        }
    }

    /// Get a value, returns None if expired or missing.
    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.store.get(key)?;
        if Instant::now() >= entry.expires_at {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert or update a value.
    pub fn put(&self, key: String, value: String, ttl: Duration) {
        // Over capacity: skip new keys, periodic eviction makes room
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            return;
        }
        let ttl = match self.max_ttl {
            Some(max) => ttl.min(max),
            None => ttl,
        };
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 86_400));
        self.store.insert(key, CacheEntry { value, expires_at });
    }

    pub fn remove(&self, key: &str) {
        self.store.remove(key);
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        let now = Instant::now();
        self.store.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.store.len())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.get(key))
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        self.put(key.to_string(), value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.remove(key);
        Ok(())
    }
}
