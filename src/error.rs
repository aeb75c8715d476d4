//! Cache error types

use std::sync::Arc;

use redis::RedisError;

/// Boxed error produced by a store or a caller-supplied loader.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shareable error source, cloned into every waiter of a single-flight group.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias using [`CacheError`]
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache-related errors
///
/// The enum is `Clone` so a single loader failure can be handed to every
/// concurrent caller of the same key unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Null/empty key, non-positive TTL, disallowed null value, bad specification
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A layer operation failed (I/O error, timeout, connection loss)
    #[error("{layer} {operation} failed: {source}")]
    Backend {
        layer: &'static str,
        operation: &'static str,
        #[source]
        source: SharedError,
    },

    /// Strong-consistency write aborted
    #[error("{layer} write failed with STRONG consistency for key {key}: {source}")]
    Write {
        layer: &'static str,
        key: String,
        #[source]
        source: Box<CacheError>,
    },

    /// The caller-supplied loader failed
    #[error("Loader error: {0}")]
    Loader(SharedError),

    /// The leading load was cancelled or panicked before producing a result
    #[error("Load aborted for key {0}")]
    LoadAborted(String),

    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// Background queue is closed
    #[error("Cache is shut down")]
    ShutDown,
}

impl CacheError {
    /// Wrap a store failure for the given layer and operation.
    pub fn backend(
        layer: &'static str,
        operation: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Backend {
            layer,
            operation,
            source: Arc::from(source.into()),
        }
    }

    /// Wrap a loader failure.
    pub fn loader(source: impl Into<BoxError>) -> Self {
        Self::Loader(Arc::from(source.into()))
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// True for caller errors, which are never routed through a fallback policy.
    pub fn is_argument_error(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        Self::backend("L2", "command", e)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(e))
    }
}
