//! Error types for pools and rate limiters

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Pool {pool} reached maximum waiter size: {max_waiters}")]
    SizeLimitExceeded { pool: String, max_waiters: usize },

    #[error("Object creation failed: {0}")]
    CreationFailed(String),

    #[error("Exceeded creation timeout of {0:?}")]
    CreationTimeout(Duration),

    #[error("Exceeded waiter timeout of {0:?}")]
    WaiterTimeout(Duration),

    #[error("Object validation failed")]
    ValidationFailed,

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Cannot submit callback because the buffer is full at {max_buffered} tasks for rate limiter: {limiter}")]
    BufferFull { max_buffered: usize, limiter: String },

    #[error("Circular buffer is empty")]
    BufferEmpty,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Object destruction failed: {0}")]
    DestroyFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl PoolError {
    /// Whether the caller may simply retry the failed operation.
    ///
    /// ```
    /// use transport_pool::PoolError;
    ///
    /// let err = PoolError::SizeLimitExceeded { pool: "p".into(), max_waiters: 1 };
    /// assert!(err.is_retryable());
    /// assert!(!PoolError::Cancelled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::SizeLimitExceeded { .. } | PoolError::BufferFull { .. }
        )
    }

    pub(crate) fn illegal_state(name: &str, state: impl std::fmt::Debug) -> Self {
        PoolError::IllegalState(format!("{name} is {state:?}"))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
