//! Time source and sleeps used by the engine.

use std::time::{Duration, Instant};

/// Monotonic time source the engine sleeps against.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `Instant` and `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Convert a configured number of seconds into a `Duration`, clamping
/// negative and non-finite values to zero and saturating values too large
/// for a `Duration`.
pub fn seconds(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_clamps_bad_values() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(0.25), Duration::from_millis(250));
    }

    #[test]
    fn seconds_saturates_huge_values() {
        assert_eq!(seconds(1e30), Duration::MAX);
        assert_eq!(seconds(f64::MAX), Duration::MAX);
    }

    #[test]
    fn system_clock_sleeps_at_least_requested() {
        let clock = SystemClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(20));
        assert!(clock.now() - start >= Duration::from_millis(20));
    }
}
