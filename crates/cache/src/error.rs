use experiment_core::ExperimentError;
use std::time::Duration;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

impl From<CacheError> for ExperimentError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Timeout(after) => {
                ExperimentError::Timeout(format!("cache call exceeded {after:?}"))
            }
            other => ExperimentError::Cache(other.to_string()),
        }
    }
}
