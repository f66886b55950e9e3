//! Key-value cache abstraction shared by every tier.

use crate::error::CacheResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use crate::error::CacheError;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> CacheResult<Option<T>> {
    match cache.get_raw(key).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Encode and store a JSON value with a TTL.
pub async fn set_json<T: Serialize + ?Sized>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> CacheResult<()> {
    let json = serde_json::to_string(value)?;
    cache.set_raw(key, json, ttl).await
}

/// Bound a remote call by `limit`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> CacheResult<T>
where
    F: Future<Output = CacheResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(limit)),
    }
}
