use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Time capability consumed by the engines. Production code injects
/// `SystemClock`; tests drive manual implementations.
pub trait Clock {
    /// Current point on the monotonic clock.
    fn now(&self) -> Instant;

    /// Current unix timestamp in seconds.
    fn timestamp_secs(&self) -> u64;

    /// Suspends the caller for the given duration.
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn timestamp_secs(&self) -> u64 {
        timestamp_secs()
    }

    #[inline]
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

/// Absolute deadline on the monotonic clock. Every externally observable
/// operation in the core is bounded by one of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Deadline(Instant);

impl Deadline {
    #[inline]
    pub fn at(instant: Instant) -> Deadline {
        Deadline(instant)
    }

    #[inline]
    pub fn after(now: Instant, timeout: Duration) -> Deadline {
        Deadline(now + timeout)
    }

    #[inline]
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.0
    }

    /// Time left until expiry, zero once the deadline has passed.
    #[inline]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now)
    }

    #[inline]
    pub fn instant(&self) -> Instant {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expiry() {
        let now = Instant::now();
        let deadline = Deadline::after(now, Duration::from_millis(50));

        assert!(!deadline.expired(now));
        assert_eq!(deadline.remaining(now), Duration::from_millis(50));

        let later = now + Duration::from_millis(80);

        assert!(deadline.expired(later));
        assert_eq!(deadline.remaining(later), Duration::from_secs(0));
    }
}
