//! Score-ordered collections (Redis sorted sets) used for sliding windows.
//!
//! Ranks follow Redis semantics: inclusive bounds, negative indexes count
//! from the end (`-1` is the last member). Score bounds are inclusive.

use crate::error::{CacheError, CacheResult};
use crate::kv::with_timeout;
use async_trait::async_trait;
use dashmap::DashMap;
use experiment_core::config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// Insert `member` with `score`, or move it to `score` if present.
    async fn add(&self, key: &str, member: &str, score: f64) -> CacheResult<()>;

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<Vec<(String, f64)>>;

    async fn range_by_rank(&self, key: &str, start: isize, stop: isize)
        -> CacheResult<Vec<(String, f64)>>;

    /// Returns the number of members removed.
    async fn remove_range_by_rank(&self, key: &str, start: isize, stop: isize) -> CacheResult<u64>;

    /// Returns the number of members removed.
    async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<u64>;

    async fn count(&self, key: &str) -> CacheResult<u64>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;
}

/// Sorted sets on Redis (ZADD, ZRANGEBYSCORE, ZRANGE, ZREMRANGEBYRANK, ...).
pub struct RedisOrderedStore {
    conn: ConnectionManager,
    io_timeout: Duration,
}

impl RedisOrderedStore {
    pub fn new(conn: ConnectionManager, config: &RedisConfig) -> Self {
        Self {
            conn,
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        }
    }
}

#[async_trait]
impl OrderedStore for RedisOrderedStore {
    async fn add(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.zadd::<_, _, _, ()>(key, member, score)
                .await
                .map_err(CacheError::from)
        })
        .await
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.zrangebyscore_withscores(key, min, max)
                .await
                .map_err(CacheError::from)
        })
        .await
    }

    async fn range_by_rank(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> CacheResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.zrange_withscores(key, start, stop)
                .await
                .map_err(CacheError::from)
        })
        .await
    }

    async fn remove_range_by_rank(&self, key: &str, start: isize, stop: isize) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.zremrangebyrank(key, start, stop)
                .await
                .map_err(CacheError::from)
        })
        .await
    }

    async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.zrembyscore(key, min, max)
                .await
                .map_err(CacheError::from)
        })
        .await
    }

    async fn count(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.zcard(key).await.map_err(CacheError::from)
        })
        .await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.del::<_, ()>(key).await.map_err(CacheError::from)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1) as i64;
        with_timeout(self.io_timeout, async {
            conn.expire::<_, ()>(key, seconds)
                .await
                .map_err(CacheError::from)
        })
        .await
    }
}

/// In-process sorted sets. Members are kept ordered by (score, member).
/// Key expiry is not tracked; windows are bounded by trimming.
#[derive(Default)]
pub struct LocalOrderedStore {
    sets: DashMap<String, Vec<(String, f64)>>,
}

impl LocalOrderedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve Redis-style inclusive rank bounds against a set of `len` members.
fn resolve_ranks(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn position(set: &[(String, f64)], member: &str, score: f64) -> usize {
    set.partition_point(|(m, s)| {
        s.total_cmp(&score)
            .then_with(|| m.as_str().cmp(member))
            .is_lt()
    })
}

#[async_trait]
impl OrderedStore for LocalOrderedStore {
    async fn add(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut set = self.sets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        let at = position(&set, member, score);
        set.insert(at, (member.to_string(), score));
        Ok(())
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<Vec<(String, f64)>> {
        Ok(self
            .sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, s)| *s >= min && *s <= max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn range_by_rank(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> CacheResult<Vec<(String, f64)>> {
        let Some(set) = self.sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_ranks(set.len(), start, stop) {
            Some((from, to)) => set[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn remove_range_by_rank(&self, key: &str, start: isize, stop: isize) -> CacheResult<u64> {
        let Some(mut set) = self.sets.get_mut(key) else {
            return Ok(0);
        };
        Ok(match resolve_ranks(set.len(), start, stop) {
            Some((from, to)) => set.drain(from..=to).count() as u64,
            None => 0,
        })
    }

    async fn remove_range_by_score(&self, key: &str, min: f64, max: f64) -> CacheResult<u64> {
        let Some(mut set) = self.sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(_, s)| *s < min || *s > max);
        Ok((before - set.len()) as u64)
    }

    async fn count(&self, key: &str) -> CacheResult<u64> {
        Ok(self.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.sets.remove(key);
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(n: usize) -> LocalOrderedStore {
        let store = LocalOrderedStore::new();
        for i in 0..n {
            store
                .add("k", &format!("m{i}"), (i * 10) as f64)
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_resolve_ranks() {
        assert_eq!(resolve_ranks(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_ranks(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_ranks(5, 0, 100), Some((0, 4)));
        assert_eq!(resolve_ranks(5, 3, 1), None);
        assert_eq!(resolve_ranks(5, 0, -6), None);
        assert_eq!(resolve_ranks(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_members_are_score_ordered() {
        let store = LocalOrderedStore::new();
        store.add("k", "late", 30.0).await.unwrap();
        store.add("k", "early", 10.0).await.unwrap();
        store.add("k", "mid", 20.0).await.unwrap();
        let all = store.range_by_rank("k", 0, -1).await.unwrap();
        let members: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["early", "mid", "late"]);
    }

    #[tokio::test]
    async fn test_re_adding_moves_member() {
        let store = seeded(3).await;
        store.add("k", "m0", 100.0).await.unwrap();
        assert_eq!(store.count("k").await.unwrap(), 3);
        let last = store.range_by_rank("k", -1, -1).await.unwrap();
        assert_eq!(last, vec![("m0".to_string(), 100.0)]);
    }

    #[tokio::test]
    async fn test_trim_oldest_by_rank() {
        let store = seeded(5).await;
        let removed = store.remove_range_by_rank("k", 0, 1).await.unwrap();
        assert_eq!(removed, 2);
        let remaining = store.range_by_rank("k", 0, -1).await.unwrap();
        assert_eq!(remaining.first().map(|(m, _)| m.as_str()), Some("m2"));
    }

    #[tokio::test]
    async fn test_score_ranges_are_inclusive() {
        let store = seeded(5).await;
        let hits = store.range_by_score("k", 10.0, 30.0).await.unwrap();
        assert_eq!(hits.len(), 3);
        let removed = store
            .remove_range_by_score("k", f64::NEG_INFINITY, 20.0)
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.count("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_key_is_empty() {
        let store = LocalOrderedStore::new();
        assert_eq!(store.count("none").await.unwrap(), 0);
        assert!(store.range_by_rank("none", 0, -1).await.unwrap().is_empty());
        assert_eq!(store.remove_range_by_rank("none", 0, -1).await.unwrap(), 0);
    }
}
