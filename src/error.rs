use std::time::Duration;

/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum QuotaBucketError {
    /// The store has been closed; every operation fails from then on.
    #[error("store is stopped")]
    Stopped,

    /// No usable connection could be obtained (refused, dropped, I/O failure or
    /// failed health probe).
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[error("connection unavailable, {context}: {source}")]
    ConnectionUnavailable {
        /// What was being attempted.
        context: &'static str,
        /// Underlying Redis error.
        source: redis::RedisError,
    },

    /// The server rejected or failed a command or script.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[error("{context}: {source}")]
    ProcedureExecutionFailed {
        /// What was being attempted.
        context: &'static str,
        /// Underlying Redis error.
        source: redis::RedisError,
    },

    /// The server reply did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The operation did not finish before the configured deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid token count.
    #[error("invalid tokens: {0}")]
    InvalidTokens(String),

    /// Invalid refill interval.
    #[error("invalid refill interval: {0}")]
    InvalidRefillInterval(String),

    /// Invalid Redis key.
    #[error("invalid redis key: {0}")]
    InvalidRedisKey(String),

    /// Invalid key prefix.
    #[error("invalid key prefix: {0}")]
    InvalidKeyPrefix(String),

    /// Invalid connection count.
    #[error("invalid redis client connection count: {0}")]
    InvalidRedisClientConnectionCount(String),
}

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
impl QuotaBucketError {
    /// Classify a Redis error: transport failures become
    /// [`QuotaBucketError::ConnectionUnavailable`], everything else
    /// [`QuotaBucketError::ProcedureExecutionFailed`].
    pub(crate) fn from_redis(context: &'static str, source: redis::RedisError) -> Self {
        if source.is_io_error()
            || source.is_connection_refusal()
            || source.is_connection_dropped()
            || source.is_timeout()
        {
            Self::ConnectionUnavailable { context, source }
        } else {
            Self::ProcedureExecutionFailed { context, source }
        }
    }

    /// Whether a caller-side retry policy may reasonably retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionUnavailable { .. } | Self::Timeout(_))
    }
}

#[cfg(not(any(feature = "redis-tokio", feature = "redis-smol")))]
impl QuotaBucketError {
    /// Whether a caller-side retry policy may reasonably retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
