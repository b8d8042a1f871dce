use std::time::{Duration, Instant};

/// Token bucket for per-session move messages.
///
/// Holds up to one second's worth of tokens so a short burst after a stall
/// is accepted.
pub struct MoveLimiter {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl MoveLimiter {
    pub fn new(per_sec: u32, now: Instant) -> Self {
        let capacity = f64::from(per_sec.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity,
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn allow(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.refill(elapsed);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
    }
}
