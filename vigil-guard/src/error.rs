//! Error types for the Vigil detection core.
//!
//! This module provides the crate-wide error handling strategy using `thiserror`
//! for automatic error trait implementations. Failures that the resilience layer
//! handles internally (transient connection trouble) are represented by
//! [`BackendError`](crate::backend::BackendError); everything that escapes to a
//! caller is a `GuardError`.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// The main error type for the Vigil library.
///
/// The taxonomy follows the recovery policy, not the failure site: transient
/// backend classes are retried internally and only surface here once the retry
/// budget is spent, while fail-fast classes (`CircuitOpen`, `PoolExhausted`)
/// surface immediately.
#[derive(Error, Debug)]
pub enum GuardError {
    /// A transient backend failure persisted through every allowed retry.
    #[error("backend operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Total attempts made (initial try plus retries).
        attempts: u32,
        /// The last transient error observed.
        #[source]
        source: BackendError,
    },

    /// The circuit breaker is open; the backend was not contacted.
    #[error("circuit breaker open for backend '{backend}', retry in {retry_after:?}")]
    CircuitOpen {
        /// Name of the guarded backend.
        backend: String,
        /// Remaining cooldown before a probe will be admitted.
        retry_after: Duration,
    },

    /// No pooled connection became available within the acquire timeout.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// How long the caller waited for a connection.
        waited: Duration,
    },

    /// Not enough history to trust a baseline. Non-fatal: the metric is
    /// skipped for this run and any previously stored baseline is retained.
    #[error("insufficient samples for metric '{metric}': {available} available, {required} required")]
    InsufficientSamples {
        /// The metric whose baseline could not be refreshed.
        metric: String,
        /// Samples actually available in the window.
        available: usize,
        /// Samples required by policy.
        required: usize,
    },

    /// A non-transient backend failure (malformed query, auth, unsupported
    /// operation). Never retried.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Malformed or missing configuration. Fatal at startup, before any
    /// detection task runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error from serialization/deserialization operations.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, GuardError>`.
///
/// This is the standard `Result` type used throughout the Vigil library.
pub type Result<T> = std::result::Result<T, GuardError>;

impl GuardError {
    /// Creates a configuration error with the given message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns `true` when the error is the non-fatal "skip this metric"
    /// outcome rather than a hard failure.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::InsufficientSamples { .. })
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_preserves_source() {
        use std::error::Error;

        let err = GuardError::RetriesExhausted {
            attempts: 4,
            source: BackendError::Connection("connection reset".to_string()),
        };
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(err.source().is_some());
    }

    #[test]
    fn insufficient_samples_is_skip() {
        let err = GuardError::InsufficientSamples {
            metric: "hourly_ingestion_rate".to_string(),
            available: 3,
            required: 10,
        };
        assert!(err.is_skip());
        assert!(err.to_string().contains("3 available, 10 required"));
    }

    #[test]
    fn circuit_open_is_not_skip() {
        let err = GuardError::CircuitOpen {
            backend: "cdc".to_string(),
            retry_after: Duration::from_secs(30),
        };
        assert!(!err.is_skip());
    }
}
