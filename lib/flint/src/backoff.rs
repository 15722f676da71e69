use rand::Rng;
use std::cmp;
use std::time::Duration;

// Doubling beyond this many attempts would overflow well past any sane cap
const MAX_SHIFT: u32 = 16;

/// Exponential backoff with a hard cap and optional full jitter. The link
/// layer runs it plain (the bus is private, collisions are not a concern),
/// the sync client runs it with jitter so a fleet of gateways does not
/// hammer the backend in lockstep after an outage.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    jitter: bool,
}

impl Backoff {
    #[inline]
    pub fn new(base: Duration, cap: Duration) -> Backoff {
        Backoff {
            base,
            cap,
            attempt: 0,
            jitter: false,
        }
    }

    #[inline]
    pub fn with_full_jitter(base: Duration, cap: Duration) -> Backoff {
        Backoff {
            jitter: true,
            ..Backoff::new(base, cap)
        }
    }

    /// Delay to apply before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let shift = cmp::min(self.attempt, MAX_SHIFT);
        let capped = cmp::min(self.cap, self.base.saturating_mul(1 << shift));

        self.attempt += 1;

        if self.jitter {
            let millis = capped.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
        } else {
            capped
        }
    }

    /// Number of attempts made since construction or the last reset.
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
