use crate::errors::{PoolError, PoolResult};

use std::time::Duration;

/// Immutable permit issuance rate: `events` permits every `period`.
///
/// A burst smaller than the requested permits per period shrinks the period
/// so that no more than `burst` permits are issued at once. A fractional
/// rate below one permit per period stretches the period instead.
///
/// # Examples
///
/// ```
/// use transport_pool::Rate;
/// use std::time::Duration;
///
/// // 100 permits per second, at most 10 at a time: 10 every 100ms
/// let rate = Rate::new(100.0, Duration::from_secs(1), 10).unwrap();
/// assert_eq!(rate.events(), 10);
/// assert_eq!(rate.period(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    events_raw: f64,
    events: usize,
    period_ms: u64,
    burst: usize,
}

impl Rate {
    pub const ZERO: Rate = Rate {
        events_raw: 0.0,
        events: 0,
        period_ms: 1_000,
        burst: 1,
    };

    /// Unlimited issuance, used to drain buffers quickly.
    pub const MAX: Rate = Rate {
        events_raw: u32::MAX as f64,
        events: u32::MAX as usize,
        period_ms: 1,
        burst: u32::MAX as usize,
    };

    pub fn new(permits_per_period: f64, period: Duration, burst: usize) -> PoolResult<Self> {
        if !permits_per_period.is_finite() || permits_per_period < 0.0 {
            return Err(PoolError::InvalidConfiguration(format!(
                "permits per period must be non-negative, got {permits_per_period}"
            )));
        }
        let period_ms = period.as_millis() as f64;
        if period_ms < 1.0 {
            return Err(PoolError::InvalidConfiguration(
                "period must be at least one millisecond".to_string(),
            ));
        }
        if burst == 0 {
            return Err(PoolError::InvalidConfiguration(
                "burst must be positive".to_string(),
            ));
        }

        if permits_per_period == 0.0 {
            return Ok(Self {
                events_raw: 0.0,
                events: 0,
                period_ms: period_ms as u64,
                burst,
            });
        }

        let (events, scaled_period) = if permits_per_period < 1.0 {
            (1.0, period_ms / permits_per_period)
        } else if (burst as f64) < permits_per_period {
            (burst as f64, period_ms * burst as f64 / permits_per_period)
        } else {
            (permits_per_period.round(), period_ms * permits_per_period.round() / permits_per_period)
        };

        if scaled_period < 1.0 {
            return Err(PoolError::InvalidConfiguration(format!(
                "{permits_per_period} permits per {period:?} with burst {burst} needs a sub-millisecond period"
            )));
        }

        Ok(Self {
            events_raw: permits_per_period,
            events: events as usize,
            period_ms: scaled_period.round() as u64,
            burst,
        })
    }

    /// Permits issued per period after rescaling.
    pub fn events(&self) -> usize {
        self.events
    }

    /// The permits per period as originally requested.
    pub fn events_raw(&self) -> f64 {
        self.events_raw
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn burst(&self) -> usize {
        self.burst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_not_limiting() {
        let rate = Rate::new(5.0, Duration::from_secs(1), usize::MAX).unwrap();
        assert_eq!(rate.events(), 5);
        assert_eq!(rate.period(), Duration::from_secs(1));
    }

    #[test]
    fn test_burst_rescales_period() {
        let rate = Rate::new(200.0, Duration::from_secs(1), 1).unwrap();
        assert_eq!(rate.events(), 1);
        assert_eq!(rate.period(), Duration::from_millis(5));
        assert_eq!(rate.events_raw(), 200.0);
    }

    #[test]
    fn test_fractional_rate_stretches_period() {
        let rate = Rate::new(0.05, Duration::from_secs(1), 1).unwrap();
        assert_eq!(rate.events(), 1);
        assert_eq!(rate.period(), Duration::from_secs(20));
    }

    #[test]
    fn test_sub_millisecond_period_is_rejected() {
        let err = Rate::new(5_000.0, Duration::from_secs(1), 1).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_zero_rate() {
        let rate = Rate::new(0.0, Duration::from_secs(1), 1).unwrap();
        assert_eq!(rate.events(), 0);
    }
}
