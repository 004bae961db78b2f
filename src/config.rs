//! Pool and rate limiter configuration

use crate::errors::{PoolError, PoolResult};

use std::time::Duration;

/// Order in which idle items are handed out by the exclusive pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Most recently used first; keeps the number of warm items small.
    #[default]
    Mru,
    /// Least recently used first; spreads requests across every item.
    Lru,
}

/// Configuration for pool behavior
///
/// # Examples
///
/// ```
/// use transport_pool::{PoolConfiguration, Strategy};
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_max_size(100)
///     .with_min_size(5)
///     .with_max_waiters(1000)
///     .with_idle_timeout(Duration::from_secs(30))
///     .with_strategy(Strategy::Lru);
///
/// assert_eq!(config.max_size, 100);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Maximum number of items, counting idle, checked out and in-flight creations
    pub max_size: usize,

    /// Number of items kept alive even when idle
    pub min_size: usize,

    /// Maximum number of queued waiters before `get` is rejected
    pub max_waiters: usize,

    /// Idle items (or the shared item) older than this are destroyed
    pub idle_timeout: Option<Duration>,

    /// Fail queued waiters that waited longer than this
    pub waiter_timeout: Option<Duration>,

    /// Deadline for a single lifecycle `create`
    pub creation_timeout: Duration,

    /// Idle item selection
    pub strategy: Strategy,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_size: 0,
            max_waiters: usize::MAX,
            idle_timeout: None,
            waiter_timeout: None,
            creation_timeout: Duration::from_secs(10),
            strategy: Strategy::Mru,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_waiters(mut self, waiters: usize) -> Self {
        self.max_waiters = waiters;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_waiter_timeout(mut self, timeout: Duration) -> Self {
        self.waiter_timeout = Some(timeout);
        self
    }

    pub fn with_creation_timeout(mut self, timeout: Duration) -> Self {
        self.creation_timeout = timeout;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Reaper period for the configured idle timeout: a tenth of the
    /// timeout, at most one second.
    pub(crate) fn reap_period(&self) -> Option<Duration> {
        self.idle_timeout
            .filter(|t| !t.is_zero())
            .map(|t| (t / 10).min(Duration::from_secs(1)))
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfiguration(
                "max_size must be positive".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.creation_timeout.is_zero() {
            return Err(PoolError::InvalidConfiguration(
                "creation_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`ExponentialBackOffRateLimiter`](crate::ExponentialBackOffRateLimiter)
///
/// # Examples
///
/// ```
/// use transport_pool::RateLimiterConfiguration;
/// use std::time::Duration;
///
/// let config = RateLimiterConfiguration::new()
///     .with_period_bounds(Duration::ZERO, Duration::from_secs(5))
///     .with_initial_increment(Duration::from_millis(50))
///     .with_max_running_tasks(2);
///
/// assert_eq!(config.max_running_tasks, 2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiterConfiguration {
    pub min_period: Duration,
    pub max_period: Duration,
    /// Period used by the first `increment_period` after an unthrottled state
    pub initial_increment: Duration,
    pub max_running_tasks: usize,
}

impl Default for RateLimiterConfiguration {
    fn default() -> Self {
        Self {
            min_period: Duration::ZERO,
            max_period: Duration::from_secs(5),
            initial_increment: Duration::from_millis(20),
            max_running_tasks: 1,
        }
    }
}

impl RateLimiterConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_period_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_period = min;
        self.max_period = max;
        self
    }

    pub fn with_initial_increment(mut self, increment: Duration) -> Self {
        self.initial_increment = increment;
        self
    }

    pub fn with_max_running_tasks(mut self, count: usize) -> Self {
        self.max_running_tasks = count;
        self
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.min_period > self.max_period {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_period {:?} exceeds max_period {:?}",
                self.min_period, self.max_period
            )));
        }
        if self.initial_increment.is_zero() {
            return Err(PoolError::InvalidConfiguration(
                "initial_increment must be positive".to_string(),
            ));
        }
        if self.max_running_tasks == 0 {
            return Err(PoolError::InvalidConfiguration(
                "max_running_tasks must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
