//! Cache access that never fails the caller. Errors are logged and counted.

use experiment_cache::{get_json, set_json, Cache};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

pub(crate) async fn cached<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    match get_json(cache, key).await {
        Ok(value) => value,
        Err(e) => {
            metrics::counter!("cache.errors").increment(1);
            warn!(key = key, error = %e, "Cache read failed, falling back to store");
            None
        }
    }
}

pub(crate) async fn cache_put<T: Serialize + ?Sized>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) {
    if ttl.is_zero() {
        return;
    }
    if let Err(e) = set_json(cache, key, value, ttl).await {
        metrics::counter!("cache.errors").increment(1);
        warn!(key = key, error = %e, "Cache write failed");
    }
}

pub(crate) async fn cache_evict(cache: &dyn Cache, key: &str) {
    if let Err(e) = cache.delete(key).await {
        metrics::counter!("cache.errors").increment(1);
        warn!(key = key, error = %e, "Cache invalidation failed");
    }
}
