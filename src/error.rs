//! Error taxonomy for the cache client.
//!
//! Every public operation returns [`Result<T>`], an alias over [`CacheError`].
//! Locally recoverable conditions (a transient connection reset on an
//! idempotent read) are retried internally by the gateway and never reach
//! this type; everything here is meant to surface to the caller unchanged.

use thiserror::Error;

/// Errors produced by the cache client.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The database connection or a query against it failed after retries.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Serialization or deserialization of a cached value failed.
    #[error("encoding error: {0}")]
    EncodingError(String),

    /// The caller-supplied loader returned an error. Never cached.
    #[error("loader error: {0}")]
    LoaderError(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The caller's deadline elapsed or the operation was cancelled explicitly.
    #[error("operation cancelled")]
    Cancelled,

    /// The cache was already closed via [`crate::Cache::close`].
    #[error("cache is closed")]
    Closed,

    /// Invalid configuration, surfaced at construction time only.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::BackendUnavailable(e.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::EncodingError(e.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_unavailable_displays_inner_message() {
        let err = CacheError::BackendUnavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "backend unavailable: connection refused");
    }

    #[test]
    fn sqlx_error_converts_to_backend_unavailable() {
        let sqlx_err = sqlx::Error::PoolClosed;
        let err: CacheError = sqlx_err.into();
        assert!(matches!(err, CacheError::BackendUnavailable(_)));
    }
}
