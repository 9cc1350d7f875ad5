//! Time source for the rate limiter
//!
//! Bucket math works on Unix seconds as `f64` so partial-second refill is exact
//! enough without carrying `Instant`s across process boundaries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time in Unix seconds
pub trait Clock: Send + Sync {
    /// Current time in (fractional) Unix seconds
    fn now(&self) -> f64;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Manually advanced clock, used to simulate elapsed time
#[derive(Debug)]
pub struct ManualClock {
    /// Current time in microseconds since the epoch
    micros: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start` Unix seconds
    pub fn new(start: f64) -> Self {
        Self {
            micros: AtomicU64::new((start * 1_000_000.0) as u64),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000.0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(Duration::from_secs(6));
        assert_eq!(clock.now(), 106.0);

        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), 106.5);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now() > 1_600_000_000.0);
    }
}
