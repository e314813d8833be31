//! Error type definitions
//!
//! Provides all possible error types in the redisqueue crate.

use std::time::Duration;

/// Result type alias for redisqueue
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for redisqueue
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Message content could not be serialized into an envelope
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Bytes do not parse to the expected envelope shape
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Submission to the queue engine failed
    #[error("Enqueue to '{queue}' failed: {source}")]
    Enqueue {
        /// Target queue
        queue: String,
        /// Underlying engine failure
        #[source]
        source: Box<Error>,
    },

    /// Handler processing errors
    #[error("Handler error: {0}")]
    Handler(String),

    /// No handler registered for a task type
    #[error("No handler registered for task type: {0}")]
    HandlerNotFound(String),

    /// Drain did not complete within the configured bound
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// Operation cancelled through its context
    #[error("Operation cancelled")]
    Cancelled,

    /// Lifecycle call made in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Redis-related errors
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::RedisError),

    /// Task record (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Task record missing from the engine
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The queue engine was closed
    #[error("Broker closed")]
    BrokerClosed,

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Unknown errors
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Check if the error is transient and the operation may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Redis(_) | Error::TaskNotFound(_))
    }

    /// Check if the error is fatal for a running worker pool
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BrokerClosed | Error::Config(_))
    }

    /// Get the suggested delay before retrying a failed engine call
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Redis(_) => Some(Duration::from_secs(1)),
            Error::TaskNotFound(_) => Some(Duration::from_millis(100)),
            _ => None,
        }
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        use fred::error::RedisErrorKind;
        assert!(Error::Redis(fred::error::RedisError::new(RedisErrorKind::Unknown, "test")).is_retryable());
        assert!(Error::TaskNotFound("abc".to_string()).is_retryable());
        assert!(!Error::Validation("test".to_string()).is_retryable());
        assert!(!Error::MalformedEnvelope("test".to_string()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::BrokerClosed.is_fatal());
        assert!(Error::Config("bad".to_string()).is_fatal());
        assert!(!Error::Handler("boom".to_string()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_enqueue_error_keeps_source() {
        let err = Error::Enqueue {
            queue: "emails".to_string(),
            source: Box::new(Error::BrokerClosed),
        };
        assert_eq!(err.to_string(), "Enqueue to 'emails' failed: Broker closed");
        assert!(std::error::Error::source(&err).is_some());
    }
}
