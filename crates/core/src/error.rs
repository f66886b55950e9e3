use thiserror::Error;

pub type ExperimentResult<T> = Result<T, ExperimentError>;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported by store: {0}")]
    Unsupported(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Exchange-rate source error: {0}")]
    RateSource(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ExperimentError {
    /// Cache, rate-source and timeout failures. Non-critical paths log these
    /// and carry on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExperimentError::Cache(_) | ExperimentError::RateSource(_) | ExperimentError::Timeout(_)
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, ExperimentError::Unsupported(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ExperimentError::NotFound(_))
    }
}
