//! Error types for the connection pool

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared, cloneable handle to an underlying factory or validator error.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// No resource could be obtained before the caller's deadline.
    ///
    /// `cause` carries the most recent creation or validation failure, if any,
    /// which is usually the reason the pool could not keep up.
    #[error(
        "{pool} - resource not available, request timed out after {waited:?} \
         (total={total}, active={active}, idle={idle}, waiting={waiting})"
    )]
    AcquisitionTimeout {
        pool: String,
        waited: Duration,
        total: usize,
        active: usize,
        idle: usize,
        waiting: usize,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("Pool has been shut down")]
    ShutdownInProgress,

    #[error("Failed to create resource")]
    CreationFailed(#[source] BoxError),

    #[error("Failed to initialize pool")]
    InitializationFailed(#[source] BoxError),

    #[error("Resource validation failed")]
    ValidationFailed(#[source] BoxError),

    #[error("Resource validation did not complete within {0:?}")]
    ValidationTimeout(Duration),

    #[error("Pool accounting inconsistency: {0}")]
    AccountingInconsistency(String),

    #[error("Pool suspension is not enabled for this pool")]
    SuspensionNotAllowed,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Failed to start background scheduler")]
    Scheduler(#[source] Arc<std::io::Error>),
}

impl PoolError {
    /// Wrap an underlying error so it can be attached to other pool errors.
    pub(crate) fn boxed<E>(err: E) -> BoxError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Arc::new(err)
    }

    /// Returns true if this is an acquisition timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::AcquisitionTimeout { .. })
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Refused;

    #[test]
    fn test_timeout_carries_cause() {
        let err = PoolError::AcquisitionTimeout {
            pool: "pool-1".to_string(),
            waited: Duration::from_millis(200),
            total: 2,
            active: 2,
            idle: 0,
            waiting: 1,
            cause: Some(PoolError::boxed(Refused)),
        };

        assert!(err.is_timeout());
        assert!(err.to_string().contains("total=2"));
        assert_eq!(err.source().map(|e| e.to_string()), Some("connection refused".to_string()));
    }

    #[test]
    fn test_creation_failure_is_not_timeout() {
        let err = PoolError::CreationFailed(PoolError::boxed(Refused));
        assert!(!err.is_timeout());
        assert!(err.source().is_some());
    }
}
