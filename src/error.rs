//! Error types for the cluster registry
//!
//! Provides structured error types for the registry facade, the membership
//! cache, the subscription manager and the store adapters.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the registry client
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No cluster mapped for lookup key: {key}")]
    ClusterNotFound { key: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timed out acquiring store connection after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Protocol violation on registry channel: {message}")]
    Protocol { message: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Registry client has been shut down")]
    Shutdown,

    // =========================================================================
    // IO / Parse Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Build a protocol fault for a message that does not fit the event grammar
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Check if this error is a store transport fault
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Redis(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Check if this error is a non-recoverable protocol fault
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol { .. })
    }

    /// Check if the caller may retry the failed operation unchanged
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Result type alias for the registry
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport = Error::Transport("connection reset".into());
        assert!(transport.is_transient());
        assert!(transport.is_retryable());
        assert!(!transport.is_fatal());

        let timeout = Error::Timeout(Duration::from_millis(250));
        assert!(timeout.is_retryable());

        let protocol = Error::protocol("10.0.0.1:8091-DELETE");
        assert!(protocol.is_fatal());
        assert!(!protocol.is_retryable());
    }

    #[test]
    fn test_input_errors_not_retryable() {
        let err = Error::InvalidAddress("0.0.0.0:0".into());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());

        let err = Error::ClusterNotFound { key: "k1".into() };
        assert_eq!(err.to_string(), "No cluster mapped for lookup key: k1");
    }
}
