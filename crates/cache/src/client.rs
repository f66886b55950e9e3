//! Redis cache client for bandit state.
//! Two-tier caching: LocalCache (L1) -> Redis (L2).

use crate::error::{CacheError, CacheResult};
use crate::kv::{with_timeout, Cache};
use crate::local::LocalCache;
use async_trait::async_trait;
use experiment_core::config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Open a managed Redis connection, verified with PING.
pub async fn connect(config: &RedisConfig) -> anyhow::Result<ConnectionManager> {
    let url = config
        .urls
        .first()
        .cloned()
        .unwrap_or_else(|| "redis://localhost:6379".to_string());

    info!(url = %url, "Connecting to Redis");

    let client = redis::Client::open(url.as_str())?;
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    let mut conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| anyhow::anyhow!("Redis connect timed out after {connect_timeout:?}"))??;

    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!(response = %pong, "Redis connection established");

    Ok(conn)
}

/// Redis-backed distributed cache with local L1 layer.
pub struct RedisCache {
    conn: ConnectionManager,
    local: Arc<LocalCache>,
    default_ttl: Duration,
    io_timeout: Duration,
}

impl RedisCache {
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let conn = connect(config).await?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn from_connection(conn: ConnectionManager, config: &RedisConfig) -> Self {
        // L1 entries live at most half of the L2 default TTL
        let local = Arc::new(LocalCache::with_max_ttl(
            Duration::from_secs((config.ttl_secs / 2).max(1)),
            1_000_000,
        ));
        Self {
            conn,
            local,
            default_ttl: Duration::from_secs(config.ttl_secs),
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        }
    }

    /// Run periodic maintenance (L1 eviction).
    pub async fn maintenance(&self) {
        let evicted = self.local.evict_expired();
        if evicted > 0 {
            debug!(evicted = evicted, "Local cache eviction complete");
        }
    }

    pub fn local_cache_size(&self) -> usize {
        self.local.len()
    }
}

#[async_trait]
impl Cache for RedisCache {
    /// Checks L1 local cache first, then Redis.
    async fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        if let Some(value) = self.local.get(key) {
            metrics::counter!("cache.l1.hit").increment(1);
            return Ok(Some(value));
        }
        metrics::counter!("cache.l1.miss").increment(1);

        let mut conn = self.conn.clone();
        let data: Option<String> = with_timeout(self.io_timeout, async {
            conn.get(key).await.map_err(CacheError::from)
        })
        .await?;

        match data {
            Some(value) => {
                metrics::counter!("cache.l2.hit").increment(1);
                // L2 TTL is unknown here; the L1 cap bounds staleness
                self.local.put(key.to_string(), value.clone(), self.default_ttl);
                Ok(Some(value))
            }
            None => {
                metrics::counter!("cache.l2.miss").increment(1);
                debug!(key = key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Store a value in both L1 and L2.
    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        with_timeout(self.io_timeout, async {
            conn.set_ex::<_, _, ()>(key, &value, seconds)
                .await
                .map_err(CacheError::from)
        })
        .await?;

        self.local.put(key.to_string(), value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.local.remove(key);
        let mut conn = self.conn.clone();
        with_timeout(self.io_timeout, async {
            conn.del::<_, ()>(key).await.map_err(CacheError::from)
        })
        .await
    }
}
